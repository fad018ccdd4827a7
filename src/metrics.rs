use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the ingestion process.
///
/// Purpose:
/// - Track tick outcomes across all sources
/// - Track record flow through the pipeline stages
/// - Track upstream retries, sink retries and sink failures
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // High-level
    pub sources_active: AtomicUsize,

    // Ticks
    pub ticks_run: AtomicUsize,
    pub ticks_failed: AtomicUsize,
    pub ticks_gated: AtomicUsize,

    // Record flow
    pub records_fetched: AtomicUsize,
    pub records_skipped: AtomicUsize,
    pub records_duplicate: AtomicUsize,
    pub records_persisted: AtomicUsize,
    pub records_delivered: AtomicUsize,

    // Retries, upstream and sink counted apart
    pub fetch_retries: AtomicUsize,
    pub delivery_retries: AtomicUsize,
    pub delivery_failures: AtomicUsize,
    pub files_pruned: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary used by the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        format!(
            "[METRICS] sources={} ticks={} failed={} gated={} fetched={} skipped={} dup={} persisted={} delivered={} retries={} delivery_retries={} delivery_err={} pruned={}",
            get(&self.sources_active),
            get(&self.ticks_run),
            get(&self.ticks_failed),
            get(&self.ticks_gated),
            get(&self.records_fetched),
            get(&self.records_skipped),
            get(&self.records_duplicate),
            get(&self.records_persisted),
            get(&self.records_delivered),
            get(&self.fetch_retries),
            get(&self.delivery_retries),
            get(&self.delivery_failures),
            get(&self.files_pruned),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
