use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheKey};

/// In-memory map of cache key to cached snapshot.
///
/// Entries are replaced wholesale; nothing here merges or patches data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalEntryStore {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl LocalEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Flag every variant of `table` (table-wide and owner-scoped) as stale.
    /// Returns how many entries changed.
    pub fn mark_stale(&mut self, table: &str) -> usize {
        self.mark_stale_where(table, |_| true)
    }

    /// Flag variants of `table` last loaded before `changed_at` as stale.
    pub fn mark_stale_before(&mut self, table: &str, changed_at: DateTime<Utc>) -> usize {
        self.mark_stale_where(table, |entry| entry.last_updated < changed_at)
    }

    fn mark_stale_where(&mut self, table: &str, pred: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut changed = 0;
        for (key, entry) in self.entries.iter_mut() {
            if key.table_name() == table && !entry.is_stale && pred(entry) {
                entry.is_stale = true;
                changed += 1;
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(CacheKey, CacheEntry)> for LocalEntryStore {
    fn from_iter<I: IntoIterator<Item = (CacheKey, CacheEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
