use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::apply::{StorageDict, SyncTarget};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Value>,
    storage: HashMap<String, StorageDict>,
}

/// In-memory session and plugin storage.
///
/// Clones share the same contents, so one handle can be given to the
/// consensus driver while another is kept for reads.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, sid: &str) -> Option<Value> {
        self.inner.lock().sessions.get(sid).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whole storage of a plugin. None if nothing was ever stored for it.
    pub fn storage(&self, plugin_id: &str) -> Option<StorageDict> {
        self.inner.lock().storage.get(plugin_id).cloned()
    }

    pub fn storage_value(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .storage
            .get(plugin_id)
            .and_then(|dict| dict.get(key))
            .cloned()
    }
}

impl SyncTarget for MemoryStore {
    fn set_session(&mut self, sid: &str, session: Value) {
        self.inner.lock().sessions.insert(sid.to_string(), session);
    }

    fn set_storage_all(&mut self, plugin_id: &str, dict: StorageDict) {
        self.inner.lock().storage.insert(plugin_id.to_string(), dict);
    }

    fn set_storage_by_key(&mut self, plugin_id: &str, key: &str, value: Value) {
        self.inner
            .lock()
            .storage
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete_storage_by_key(&mut self, plugin_id: &str, key: &str) {
        if let Some(dict) = self.inner.lock().storage.get_mut(plugin_id) {
            dict.remove(key);
        }
    }
}
