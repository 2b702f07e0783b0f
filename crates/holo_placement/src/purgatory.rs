//! Ranges whose last allocation found no eligible store.
//!
//! Entries sit here instead of in the main work queue so a cluster without
//! capacity doesn't spin. They are retried in bulk when the store pool
//! changes, or on a slow fallback timer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::RangeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgatoryEntry {
    pub error: String,
    pub since_ms: u64,
}

#[derive(Default)]
pub struct Purgatory {
    entries: Mutex<BTreeMap<RangeId, PurgatoryEntry>>,
}

impl Purgatory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a range. Returns `true` if it wasn't already parked; a range
    /// that is re-parked keeps its original entry time.
    pub fn insert(&self, range_id: RangeId, err: &anyhow::Error, now_ms: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&range_id) {
            Some(entry) => {
                entry.error = err.to_string();
                false
            }
            None => {
                entries.insert(
                    range_id,
                    PurgatoryEntry {
                        error: err.to_string(),
                        since_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&self, range_id: RangeId) -> bool {
        self.entries.lock().unwrap().remove(&range_id).is_some()
    }

    pub fn contains(&self, range_id: RangeId) -> bool {
        self.entries.lock().unwrap().contains_key(&range_id)
    }

    pub fn get(&self, range_id: RangeId) -> Option<PurgatoryEntry> {
        self.entries.lock().unwrap().get(&range_id).cloned()
    }

    /// Empties the set, returning the parked ranges in ID order.
    pub fn drain(&self) -> Vec<RangeId> {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        entries.into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
