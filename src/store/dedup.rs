use std::collections::HashSet;

use chrono::NaiveDate;
use log::warn;

use super::persistence::{DayStore, StoreError};
use crate::schema::CanonicalRecord;

/// Set of records already ingested within the active day windows.
///
/// Identity is [`CanonicalRecord::identity`]: the full field set,
/// serialized with sorted keys. There is no eviction; windows roll off
/// when the retention sweep deletes their files, and the next rebuild
/// simply no longer sees them.
#[derive(Debug, Default)]
pub struct DedupStore {
    seen: HashSet<String>,
}

impl DedupStore {
    /// Reads every persisted window dated within `[from, to]`.
    ///
    /// Unreadable (corrupted) windows are skipped with a warning; I/O
    /// errors abort the rebuild.
    pub fn rebuild(store: &DayStore, from: NaiveDate, to: NaiveDate) -> Result<Self, StoreError> {
        let mut dedup = Self::default();

        for date in store.windows()?.into_iter().filter(|d| *d >= from && *d <= to) {
            match store.load_window(date) {
                Ok(records) => records.iter().for_each(|r| dedup.mark_seen(r)),
                Err(e @ StoreError::Corrupted { .. }) => {
                    warn!("Skipping invalid window for dedup: {}", e)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(dedup)
    }

    pub fn is_new(&self, record: &CanonicalRecord) -> bool {
        !self.seen.contains(&record.identity())
    }

    pub fn mark_seen(&mut self, record: &CanonicalRecord) {
        self.seen.insert(record.identity());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Keeps records that are neither already seen nor repeated earlier
    /// in the same batch. Returns the survivors and the number dropped.
    ///
    /// Does not mark anything seen; callers do that only after the
    /// survivors have been persisted.
    pub fn filter_new(&self, records: Vec<CanonicalRecord>) -> (Vec<CanonicalRecord>, usize) {
        let total = records.len();
        let mut batch = HashSet::new();

        let fresh: Vec<CanonicalRecord> = records
            .into_iter()
            .filter(|r| self.is_new(r) && batch.insert(r.identity()))
            .collect();

        let dropped = total - fresh.len();
        (fresh, dropped)
    }
}
