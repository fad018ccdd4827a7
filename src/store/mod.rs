/// Store module
///
/// Day-scoped persistence and the dedup view built on top of it.
///
/// - persistence: one JSON file per day window per source, retention sweep
/// - dedup:       per-tick set of already ingested records
///
/// The persistence layer exclusively owns the files; the dedup store is
/// rebuilt from them at the start of every tick and never outlives it.
pub mod dedup;
pub mod persistence;

pub use dedup::DedupStore;
pub use persistence::{DayStore, StoreError};
