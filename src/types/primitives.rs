use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks and are used to detect stale leaders and candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term {
    value: u64,
}

impl Term {
    pub const ZERO: Term = Term { value: 0 };

    pub fn get(self) -> u64 {
        self.value
    }

    pub fn increment(self) -> Term {
        Term {
            value: self.value.saturating_add(1),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.value)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term { value }
    }
}

/// 0-based log index.
///
/// `LogIndex::NONE` (-1) stands for "no entry": the commit index of an empty
/// cluster, the previous index of the first entry, the match index of a peer
/// that has not acknowledged anything yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex {
    value: i64,
}

impl LogIndex {
    pub const NONE: LogIndex = LogIndex { value: -1 };
    pub const FIRST: LogIndex = LogIndex { value: 0 };

    pub const fn new(value: i64) -> LogIndex {
        LogIndex {
            value: if value < -1 { -1 } else { value },
        }
    }

    pub fn get(self) -> i64 {
        self.value
    }

    /// Index of the last entry of a log holding `len` entries.
    pub fn last_of(len: usize) -> LogIndex {
        LogIndex {
            value: len as i64 - 1,
        }
    }

    pub fn next(self) -> LogIndex {
        LogIndex {
            value: self.value.saturating_add(1),
        }
    }

    /// Previous index, never below `NONE`.
    pub fn prev(self) -> LogIndex {
        LogIndex {
            value: (self.value - 1).max(-1),
        }
    }

    /// Convert to a vector position. Returns None for `NONE`.
    pub fn to_array_index(self) -> Option<usize> {
        usize::try_from(self.value).ok()
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.value)
    }
}

impl From<i64> for LogIndex {
    fn from(value: i64) -> Self {
        LogIndex::new(value)
    }
}

impl From<usize> for LogIndex {
    fn from(value: usize) -> Self {
        LogIndex {
            value: value as i64,
        }
    }
}

/// Position of a server in the fixed, ordered peer list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId {
    value: usize,
}

impl PeerId {
    pub fn index(self) -> usize {
        self.value
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.value)
    }
}

impl From<usize> for PeerId {
    fn from(value: usize) -> Self {
        PeerId { value }
    }
}

/// Role/term epoch of a node.
///
/// Bumped on every term change and role transition. Work started under one
/// generation (vote rounds, replication rounds) captures it, and its completion
/// is discarded if the node has moved on in the meantime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Generation(u64);

impl Generation {
    pub fn next(self) -> Generation {
        Generation(self.0.wrapping_add(1))
    }
}
