use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::runtime::StateMachine;

/// Key/value contents of one plugin's storage.
pub type StorageDict = serde_json::Map<String, Value>;

/// One user session, keyed by session id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub sid: String,
    pub session: Value,
}

/// Commands replicated through the log.
///
/// Serialized adjacently tagged, e.g.
/// `{"type":"storageSet","payload":{"pluginId":"p","key":"k","value":1}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SyncCommand {
    /// Upsert a single session.
    Session(SessionData),
    /// Upsert a batch of sessions.
    Sessions(Vec<SessionData>),
    /// Replace the storage of every listed plugin.
    StorageInit(BTreeMap<String, StorageDict>),
    #[serde(rename_all = "camelCase")]
    StorageSetAll { plugin_id: String, dict: StorageDict },
    #[serde(rename_all = "camelCase")]
    StorageSet {
        plugin_id: String,
        key: String,
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    StorageDeleteAll { plugin_id: String },
    #[serde(rename_all = "camelCase")]
    StorageDelete { plugin_id: String, key: String },
}

impl SyncCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncCommand::Session(_) => "session",
            SyncCommand::Sessions(_) => "sessions",
            SyncCommand::StorageInit(_) => "storageInit",
            SyncCommand::StorageSetAll { .. } => "storageSetAll",
            SyncCommand::StorageSet { .. } => "storageSet",
            SyncCommand::StorageDeleteAll { .. } => "storageDeleteAll",
            SyncCommand::StorageDelete { .. } => "storageDelete",
        }
    }
}

/// The store that committed commands are applied to.
///
/// Operations may be repeated for the same command; implementations must
/// tolerate that.
pub trait SyncTarget {
    fn set_session(&mut self, sid: &str, session: Value);
    fn set_storage_all(&mut self, plugin_id: &str, dict: StorageDict);
    fn set_storage_by_key(&mut self, plugin_id: &str, key: &str, value: Value);
    fn delete_storage_by_key(&mut self, plugin_id: &str, key: &str);
}

/// Route a committed command to the matching store operation.
pub fn dispatch<T: SyncTarget + ?Sized>(target: &mut T, command: SyncCommand) {
    debug!(kind = command.kind(), "applying command");
    match command {
        SyncCommand::Session(data) => target.set_session(&data.sid, data.session),
        SyncCommand::Sessions(batch) => {
            for data in batch {
                target.set_session(&data.sid, data.session);
            }
        }
        SyncCommand::StorageInit(plugins) => {
            for (plugin_id, dict) in plugins {
                target.set_storage_all(&plugin_id, dict);
            }
        }
        SyncCommand::StorageSetAll { plugin_id, dict } => target.set_storage_all(&plugin_id, dict),
        SyncCommand::StorageSet {
            plugin_id,
            key,
            value,
        } => target.set_storage_by_key(&plugin_id, &key, value),
        SyncCommand::StorageDeleteAll { plugin_id } => {
            target.set_storage_all(&plugin_id, StorageDict::new())
        }
        SyncCommand::StorageDelete { plugin_id, key } => {
            target.delete_storage_by_key(&plugin_id, &key)
        }
    }
}

impl<T> StateMachine<SyncCommand> for T
where
    T: SyncTarget + Send + 'static,
{
    fn apply(&mut self, command: SyncCommand) {
        dispatch(self, command);
    }
}
