use crate::types::{LogEntry, LogIndex, Term};

/// The replicated log: an ordered, append-only sequence of entries that may
/// only shrink when a follower discards a suffix conflicting with its leader.
///
/// Lives in memory only. A restart loses the log together with the term and
/// vote it was accepted under.
#[derive(Debug)]
pub struct Log<C> {
    entries: Vec<LogEntry<C>>,
}

impl<C> Log<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        LogIndex::last_of(self.entries.len())
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    /// Term of the entry at `index`. None if the log holds no such entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entry(index).map(|entry| entry.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry<C>> {
        index.to_array_index().and_then(|idx| self.entries.get(idx))
    }

    /// Append an entry. Returns the index it was stored at.
    pub fn append(&mut self, entry: LogEntry<C>) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Keep the first `len` entries, discarding the rest.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Write `entries` starting at position `start`.
    ///
    /// An existing entry with the same term as the incoming one is kept; the
    /// first one whose term differs is discarded together with everything
    /// after it. `start` must not exceed the current length.
    pub fn merge_from(&mut self, start: usize, entries: Vec<LogEntry<C>>) {
        debug_assert!(start <= self.entries.len());
        let mut position = start.min(self.entries.len());

        for entry in entries {
            match self.entries.get(position) {
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    self.entries.truncate(position);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
            position += 1;
        }
    }
}

impl<C: Clone> Log<C> {
    /// Clone the entries in `from..=through`, clamped to what the log holds.
    pub fn slice(&self, from: LogIndex, through: LogIndex) -> Vec<LogEntry<C>> {
        let start = from.to_array_index().unwrap_or(0);
        let Some(end) = through.to_array_index() else {
            return Vec::new();
        };
        let end = end.min(self.entries.len().saturating_sub(1));
        if self.entries.is_empty() || start > end {
            return Vec::new();
        }
        self.entries[start..=end].to_vec()
    }
}

impl<C> Default for Log<C> {
    fn default() -> Self {
        Self::new()
    }
}
