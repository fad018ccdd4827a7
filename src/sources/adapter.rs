use async_trait::async_trait;

use crate::fetcher::{FetchError, Fetcher};
use crate::schema::{FetchDescriptor, RawRecord, SourceKind};

/// SourceAdapter is the abstraction layer between:
/// - The generic ingestion pipeline
/// - One upstream feed's HTTP endpoints and body format
///
/// Each implementation must:
/// - Build the requests for a fetch descriptor
/// - Split the response body into raw records
///
/// DESIGN GOALS:
/// - Zero feed-specific logic outside adapters and the normalizer
/// - One adapter per feed
/// - Adapters never touch storage, dedup or the sink
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Adapter instances are shared with the source's task
///
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Canonical source name.
    ///
    /// CONTRACT:
    /// - Must match `sources[].name` in configuration
    /// - Used as the day-window file tag and in log lines
    fn name(&self) -> &'static str;

    /// Selects the normalization rules for this feed's raw records.
    fn kind(&self) -> SourceKind;

    /// Trailing days covered by one fetch, in addition to today.
    fn window_days(&self) -> u32 {
        0
    }

    /// Whether the long cadence walks multiple pages.
    fn paginated(&self) -> bool {
        false
    }

    /// Total page count for the window, fetched before a paginated pull.
    async fn page_count(
        &self,
        _fetcher: &Fetcher,
        _window: &FetchDescriptor,
    ) -> Result<u32, FetchError> {
        Ok(1)
    }

    /// Fetches one page and splits it into raw records.
    ///
    /// IMPORTANT:
    /// - Must NEVER panic on unexpected bodies
    /// - Transient failures are returned as such; the pipeline decides
    ///   whether they mean "no data" or a failed tick
    async fn fetch_page(
        &self,
        fetcher: &Fetcher,
        descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError>;
}
