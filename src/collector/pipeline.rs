use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{Days, NaiveDate};
use log::{debug, info, warn};

use crate::fetcher::{FetchError, Fetcher};
use crate::metrics::METRICS;
use crate::normalizer::{Normalized, normalize};
use crate::schema::{CanonicalRecord, FetchDescriptor, RawRecord};
use crate::sources::adapter::SourceAdapter;
use crate::store::{DayStore, DedupStore};
use crate::uploader::Uploader;

/// How much of the upstream a tick walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    /// First page only
    Latest,
    /// Every page up to the configured cap
    Full,
}

/// Stages of one tick, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Fetching,
    Normalizing,
    Filtering,
    Persisting,
    Uploading,
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickPhase::Idle => "idle",
            TickPhase::Fetching => "fetching",
            TickPhase::Normalizing => "normalizing",
            TickPhase::Filtering => "filtering",
            TickPhase::Persisting => "persisting",
            TickPhase::Uploading => "uploading",
        };
        f.write_str(name)
    }
}

/// Hard failure of a tick, tagged with the phase it happened in.
///
/// Nothing fetched during a failed tick is marked seen.
#[derive(Debug)]
pub struct TickFailure {
    pub phase: TickPhase,
    pub error: anyhow::Error,
}

impl TickFailure {
    fn new(phase: TickPhase, error: impl Into<anyhow::Error>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }
}

impl fmt::Display for TickFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed while {}: {:#}", self.phase, self.error)
    }
}

/// Per-tick counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub pages: u32,
    pub fetched: usize,
    pub skipped: usize,
    /// Reason logged for each skipped row, in fetch order
    pub skip_reasons: Vec<String>,
    pub duplicates: usize,
    pub persisted: usize,
    pub delivered: usize,
    pub delivery_failed: usize,
}

/// ============================================================
/// Pipeline
/// ============================================================
///
/// One source's fetch → normalize → dedup → persist → upload chain.
///
/// The pipeline holds no state between ticks: the dedup view is rebuilt
/// from the day-window files at the start of every tick, so a restart
/// picks up exactly where the files leave off.
///
/// FAILURE MODEL:
/// - transient upstream failures: no data from that page, tick goes on
/// - rejected upstream request: tick fails
/// - malformed record: skipped and counted
/// - storage failure: tick fails, nothing counts as ingested
/// - delivery failure: logged only, storage stays as written
///
/// IMPORTANT:
/// - Ticks of one pipeline must never overlap; `DayStore::append` is
///   read-modify-write
pub struct Pipeline {
    adapter: Arc<dyn SourceAdapter>,
    fetcher: Fetcher,
    store: DayStore,
    uploader: Option<Uploader>,
    retention_days: u32,
    max_pages: u32,
}

impl Pipeline {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        fetcher: Fetcher,
        store: DayStore,
        uploader: Option<Uploader>,
        retention_days: u32,
        max_pages: u32,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            store,
            uploader,
            retention_days,
            max_pages: max_pages.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Days of windows kept and consulted for dedup, today included.
    ///
    /// Never shorter than the adapter's fetch window, otherwise records
    /// from the trailing days would look new again once their window is
    /// pruned.
    fn horizon_days(&self) -> u32 {
        self.retention_days
            .max(1)
            .max(self.adapter.window_days() + 1)
    }

    /// Oldest window date still inside the horizon.
    fn horizon_start(&self, today: NaiveDate) -> NaiveDate {
        let back = Days::new(u64::from(self.horizon_days() - 1));
        today.checked_sub_days(back).unwrap_or(NaiveDate::MIN)
    }

    fn fetch_window(&self, today: NaiveDate) -> FetchDescriptor {
        let back = Days::new(u64::from(self.adapter.window_days()));
        let from = today.checked_sub_days(back).unwrap_or(today);
        FetchDescriptor::first_page(from, today)
    }

    fn enter(&self, phase: TickPhase) {
        debug!("[{}] tick phase: {}", self.name(), phase);
    }

    /// Runs one tick for `today`.
    pub async fn tick(&self, mode: TickMode, today: NaiveDate) -> Result<TickReport, TickFailure> {
        let mut report = TickReport::default();

        // --------------------------------------------------
        // FETCH
        // --------------------------------------------------
        self.enter(TickPhase::Fetching);
        let window = self.fetch_window(today);
        let (pages, raws) = self
            .fetch(mode, &window)
            .await
            .map_err(|e| TickFailure::new(TickPhase::Fetching, e))?;
        report.pages = pages;
        report.fetched = raws.len();
        METRICS.records_fetched.fetch_add(raws.len(), Ordering::Relaxed);

        if raws.is_empty() {
            info!("[{}] No entries fetched", self.name());
            self.enter(TickPhase::Idle);
            return Ok(report);
        }

        // --------------------------------------------------
        // NORMALIZE
        // --------------------------------------------------
        self.enter(TickPhase::Normalizing);
        let mut records = Vec::with_capacity(raws.len());
        for raw in &raws {
            match normalize(raw, self.adapter.kind()) {
                Normalized::Accepted(record) => records.push(record),
                Normalized::Skipped(reason) => {
                    warn!("[{}] Skipping entry: {}", self.name(), reason);
                    report.skipped += 1;
                    report.skip_reasons.push(reason);
                }
            }
        }
        METRICS
            .records_skipped
            .fetch_add(report.skipped, Ordering::Relaxed);

        // --------------------------------------------------
        // FILTER
        // --------------------------------------------------
        self.enter(TickPhase::Filtering);
        let dedup = DedupStore::rebuild(&self.store, self.horizon_start(today), today)
            .map_err(|e| TickFailure::new(TickPhase::Filtering, e))?;
        debug!("[{}] {} records already ingested", self.name(), dedup.len());
        let (fresh, duplicates) = dedup.filter_new(records);
        report.duplicates = duplicates;
        METRICS
            .records_duplicate
            .fetch_add(duplicates, Ordering::Relaxed);

        if fresh.is_empty() {
            info!(
                "[{}] No new entries ({} duplicates, {} skipped)",
                self.name(),
                duplicates,
                report.skipped
            );
            self.enter(TickPhase::Idle);
            return Ok(report);
        }

        // --------------------------------------------------
        // PERSIST
        // --------------------------------------------------
        self.enter(TickPhase::Persisting);
        self.store
            .append(today, &fresh)
            .map_err(|e| TickFailure::new(TickPhase::Persisting, e))?;
        report.persisted = fresh.len();
        METRICS
            .records_persisted
            .fetch_add(fresh.len(), Ordering::Relaxed);

        // --------------------------------------------------
        // UPLOAD
        // --------------------------------------------------
        self.enter(TickPhase::Uploading);
        self.forward(&fresh, &mut report).await;

        self.enter(TickPhase::Idle);
        info!(
            "[{}] Tick done: {} fetched, {} skipped, {} duplicates, {} new",
            self.name(),
            report.fetched,
            report.skipped,
            report.duplicates,
            report.persisted
        );
        Ok(report)
    }

    /// Walks the pages for `mode`.
    ///
    /// Returns the number of pages requested and the raw records of the
    /// pages that answered. Only a rejection is an error.
    async fn fetch(
        &self,
        mode: TickMode,
        window: &FetchDescriptor,
    ) -> Result<(u32, Vec<RawRecord>), FetchError> {
        let pages = match mode {
            TickMode::Full if self.adapter.paginated() => {
                match self.adapter.page_count(&self.fetcher, window).await {
                    Ok(count) => {
                        if count > self.max_pages {
                            warn!(
                                "[{}] {} pages available, fetching the first {}",
                                self.name(),
                                count,
                                self.max_pages
                            );
                        }
                        count.clamp(1, self.max_pages)
                    }
                    Err(e) if e.is_transient() => {
                        warn!(
                            "[{}] Page count unavailable, fetching one page: {}",
                            self.name(),
                            e
                        );
                        1
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => 1,
        };

        let mut raws = Vec::new();
        for page in 1..=pages {
            debug!("[{}] Fetching page {}/{}", self.name(), page, pages);
            match self
                .adapter
                .fetch_page(&self.fetcher, &window.with_page(page))
                .await
            {
                Ok(rows) => raws.extend(rows),
                Err(e) if e.is_transient() => {
                    warn!("[{}] No data from page {}: {}", self.name(), page, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok((pages, raws))
    }

    async fn forward(&self, records: &[CanonicalRecord], report: &mut TickReport) {
        let Some(uploader) = &self.uploader else {
            warn!(
                "[{}] No sink configured, {} entries stored only",
                self.name(),
                records.len()
            );
            return;
        };

        let upload = uploader.upload(records).await;
        report.delivered = upload.delivered;
        report.delivery_failed = upload.failed;
    }

    /// Retention sweep: removes windows and log files older than the
    /// horizon. Returns the number of files removed.
    pub fn housekeep(&self, today: NaiveDate) -> Result<usize, crate::store::StoreError> {
        let removed = self.store.prune(self.horizon_start(today))?;
        METRICS
            .files_pruned
            .fetch_add(removed.len(), Ordering::Relaxed);
        if !removed.is_empty() {
            info!("[{}] Pruned {} outdated files", self.name(), removed.len());
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryPolicy, SinkConfig};
    use crate::fetcher::{Backoff, HttpTransport, RetryPolicy};
    use crate::mocks::{MockTransport, StaticAdapter};
    use crate::schema::SourceKind;
    use crate::sources::{announcements, volume};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;

    const SINK: &str = "http://sink.test/ingest";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 5).unwrap()
    }

    fn fetcher(transport: Arc<dyn HttpTransport>) -> Fetcher {
        Fetcher::new(
            transport,
            RetryPolicy {
                attempts: 2,
                backoff: Backoff::Linear {
                    base: Duration::ZERO,
                },
            },
        )
    }

    fn uploader(transport: Arc<dyn HttpTransport>) -> Uploader {
        Uploader::new(
            transport,
            &SinkConfig {
                url: SINK.into(),
                routes: HashMap::new(),
                policy: DeliveryPolicy::PerRecord,
                retries: 2,
                delay_ms: 0,
            },
        )
    }

    fn pipeline(
        adapter: Arc<dyn SourceAdapter>,
        mock: &Arc<MockTransport>,
        dir: &std::path::Path,
    ) -> Pipeline {
        Pipeline::new(
            adapter,
            fetcher(mock.clone()),
            DayStore::new(dir, "test"),
            Some(uploader(mock.clone())),
            1,
            70,
        )
    }

    fn spurt(symbol: &str, company: &str) -> RawRecord {
        json!({ "scrip_cd": symbol, "scripname": company, "Trd_vol": "100" })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn volume_body(rows: &[RawRecord]) -> String {
        Value::Array(rows.iter().cloned().map(Value::Object).collect()).to_string()
    }

    #[tokio::test]
    async fn second_identical_tick_persists_nothing() {
        let dir = tempdir().unwrap();
        let body = volume_body(&[spurt("1", "ACME"), spurt("2", "BETA")]);
        let mock = Arc::new(
            MockTransport::new()
                .respond(volume::BASE_URL, 200, &body)
                .respond(SINK, 200, ""),
        );
        let pipeline = pipeline(Arc::new(volume::VolumeAdapter::default()), &mock, dir.path());

        let first = pipeline.tick(TickMode::Latest, today()).await.unwrap();
        let second = pipeline.tick(TickMode::Latest, today()).await.unwrap();

        assert_eq!(first.persisted, 2);
        assert_eq!(first.delivered, 2);
        assert_eq!(second.persisted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(mock.calls_to(SINK), 2);
    }

    #[tokio::test]
    async fn blank_company_name_is_skipped() {
        let dir = tempdir().unwrap();
        let page = json!({ "Table": [
            { "NEWSID": "n1", "SLONGNAME": "", "NEWSSUB": "x", "TotalPageCnt": 1 },
            { "NEWSID": "n2", "SLONGNAME": "ACME LTD", "NEWSSUB": "Board Meeting",
              "SCRIP_CD": "500001", "TotalPageCnt": 1 }
        ]});
        let mock = Arc::new(
            MockTransport::new()
                .respond(announcements::BASE_URL, 200, &page.to_string())
                .respond(SINK, 200, ""),
        );
        let pipeline = pipeline(
            Arc::new(announcements::AnnouncementsAdapter::default()),
            &mock,
            dir.path(),
        );

        let report = pipeline.tick(TickMode::Full, today()).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.skip_reasons, vec!["empty SLONGNAME (NEWSID n1)".to_string()]);
        assert_eq!(report.persisted, 1);
        let stored = DayStore::new(dir.path(), "test").load_window(today()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].label(), "ACME LTD");
    }

    #[tokio::test]
    async fn failed_delivery_is_stored_once_and_not_resubmitted() {
        let dir = tempdir().unwrap();
        let body = volume_body(&[spurt("1", "ACME")]);
        let mock = Arc::new(
            MockTransport::new()
                .respond(volume::BASE_URL, 200, &body)
                .respond(SINK, 500, ""),
        );
        let pipeline = pipeline(Arc::new(volume::VolumeAdapter::default()), &mock, dir.path());

        let first = pipeline.tick(TickMode::Latest, today()).await.unwrap();
        assert_eq!(first.persisted, 1);
        assert_eq!(first.delivery_failed, 1);
        assert_eq!(mock.calls_to(SINK), 2);

        let second = pipeline.tick(TickMode::Latest, today()).await.unwrap();
        assert_eq!(second.persisted, 0);
        assert_eq!(mock.calls_to(SINK), 2);

        let stored = DayStore::new(dir.path(), "test").load_window(today()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn one_malformed_record_does_not_block_the_rest() {
        let dir = tempdir().unwrap();
        let adapter = StaticAdapter::new(
            SourceKind::Volume,
            vec![Ok(vec![spurt("1", "ACME"), spurt("2", ""), spurt("3", "GAMMA")])],
        );
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(Arc::new(adapter), &mock, dir.path());

        let report = pipeline.tick(TickMode::Latest, today()).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn duplicates_across_pages_are_forwarded_once() {
        let dir = tempdir().unwrap();
        let adapter = StaticAdapter::new(
            SourceKind::Volume,
            vec![
                Ok(vec![spurt("1", "ACME"), spurt("2", "BETA")]),
                Ok(vec![spurt("2", "BETA")]),
            ],
        );
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(Arc::new(adapter), &mock, dir.path());

        let report = pipeline.tick(TickMode::Full, today()).await.unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(mock.calls_to(SINK), 2);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_tick_without_upload() {
        let dir = tempdir().unwrap();
        // A directory where the temp file should go makes the write fail.
        let blocker = dir.path().join("2025-03-05_test.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        let adapter = StaticAdapter::new(SourceKind::Volume, vec![Ok(vec![spurt("1", "ACME")])]);
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(Arc::new(adapter), &mock, dir.path());

        let failure = pipeline.tick(TickMode::Latest, today()).await.unwrap_err();

        assert_eq!(failure.phase, TickPhase::Persisting);
        assert_eq!(mock.calls_to(SINK), 0);

        // Nothing was committed, so the record is still new next time.
        std::fs::remove_dir(&blocker).unwrap();
        let report = pipeline.tick(TickMode::Latest, today()).await.unwrap();
        assert_eq!(report.persisted, 1);
    }

    #[tokio::test]
    async fn rejection_fails_the_tick() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockTransport::new().respond(volume::BASE_URL, 404, ""));
        let pipeline = pipeline(Arc::new(volume::VolumeAdapter::default()), &mock, dir.path());

        let failure = pipeline.tick(TickMode::Latest, today()).await.unwrap_err();

        assert_eq!(failure.phase, TickPhase::Fetching);
        assert_eq!(mock.calls_to(volume::BASE_URL), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mean_no_data() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockTransport::new().respond(volume::BASE_URL, 503, ""));
        let pipeline = pipeline(Arc::new(volume::VolumeAdapter::default()), &mock, dir.path());

        let report = pipeline.tick(TickMode::Latest, today()).await.unwrap();

        assert_eq!(report, TickReport { pages: 1, ..Default::default() });
        assert_eq!(mock.calls_to(volume::BASE_URL), 2);
    }

    #[tokio::test]
    async fn full_pull_stops_at_page_cap() {
        let dir = tempdir().unwrap();
        let mut adapter = StaticAdapter::new(
            SourceKind::Volume,
            vec![
                Ok(vec![spurt("1", "A")]),
                Ok(vec![spurt("2", "B")]),
                Ok(vec![spurt("3", "C")]),
            ],
        );
        adapter.page_count = Ok(500);
        let adapter = Arc::new(adapter);
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = Pipeline::new(
            adapter.clone(),
            fetcher(mock.clone()),
            DayStore::new(dir.path(), "test"),
            None,
            1,
            2,
        );

        let report = pipeline.tick(TickMode::Full, today()).await.unwrap();

        assert_eq!(adapter.served(), vec![1, 2]);
        assert_eq!(report.persisted, 2);
    }

    #[tokio::test]
    async fn latest_mode_reads_only_the_first_page() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(StaticAdapter::new(
            SourceKind::Volume,
            vec![Ok(vec![spurt("1", "A")]), Ok(vec![spurt("2", "B")])],
        ));
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(adapter.clone(), &mock, dir.path());

        pipeline.tick(TickMode::Latest, today()).await.unwrap();

        assert_eq!(adapter.served(), vec![1]);
    }

    #[tokio::test]
    async fn transient_page_count_falls_back_to_one_page() {
        let dir = tempdir().unwrap();
        let mut adapter = StaticAdapter::new(
            SourceKind::Volume,
            vec![Ok(vec![spurt("1", "A")]), Ok(vec![spurt("2", "B")])],
        );
        adapter.page_count = Err(FetchError::Malformed("html".into()));
        let adapter = Arc::new(adapter);
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(adapter.clone(), &mock, dir.path());

        let report = pipeline.tick(TickMode::Full, today()).await.unwrap();

        assert_eq!(adapter.served(), vec![1]);
        assert_eq!(report.persisted, 1);
    }

    #[tokio::test]
    async fn housekeeping_keeps_today_and_prunes_older_windows() {
        let dir = tempdir().unwrap();
        let adapter = StaticAdapter::new(SourceKind::Volume, vec![Ok(vec![spurt("1", "A")])]);
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(Arc::new(adapter), &mock, dir.path());
        let yesterday = today().pred_opt().unwrap();

        pipeline.tick(TickMode::Latest, yesterday).await.unwrap();
        pipeline.tick(TickMode::Latest, today()).await.unwrap();

        assert_eq!(pipeline.housekeep(today()).unwrap(), 1);
        let store = DayStore::new(dir.path(), "test");
        assert_eq!(store.windows().unwrap(), vec![today()]);
    }

    #[tokio::test]
    async fn windowed_sources_dedup_across_trailing_days() {
        struct Windowed(StaticAdapter);

        #[async_trait::async_trait]
        impl SourceAdapter for Windowed {
            fn name(&self) -> &'static str {
                "windowed"
            }
            fn kind(&self) -> SourceKind {
                self.0.kind()
            }
            fn window_days(&self) -> u32 {
                6
            }
            async fn fetch_page(
                &self,
                fetcher: &Fetcher,
                descriptor: &FetchDescriptor,
            ) -> Result<Vec<RawRecord>, FetchError> {
                self.0.fetch_page(fetcher, descriptor).await
            }
        }

        let dir = tempdir().unwrap();
        let adapter = Windowed(StaticAdapter::new(
            SourceKind::Volume,
            vec![Ok(vec![spurt("1", "A")])],
        ));
        let mock = Arc::new(MockTransport::new().respond(SINK, 200, ""));
        let pipeline = pipeline(Arc::new(adapter), &mock, dir.path());
        let three_days_ago = today().checked_sub_days(Days::new(3)).unwrap();

        pipeline.tick(TickMode::Latest, three_days_ago).await.unwrap();
        assert_eq!(pipeline.housekeep(today()).unwrap(), 0);

        let report = pipeline.tick(TickMode::Latest, today()).await.unwrap();
        assert_eq!(report.persisted, 0);
        assert_eq!(report.duplicates, 1);
    }
}
