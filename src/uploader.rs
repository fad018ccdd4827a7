use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::Value;

use crate::config::{DeliveryPolicy, SinkConfig};
use crate::fetcher::{Backoff, Body, Fetcher, HttpRequest, HttpTransport, RetryPolicy};
use crate::metrics::METRICS;
use crate::schema::CanonicalRecord;

/// ============================================================
/// Uploader
/// ============================================================
///
/// Forwards newly persisted records to the downstream sink.
///
/// Delivery is best-effort: the day-window file is the durability
/// boundary, and nothing here ever touches it. A record that fails to
/// deliver stays recorded as ingested and is not offered again.
///
/// Policies:
/// - PerRecord: one POST per record with its own retry budget; a failed
///   record does not stop the ones after it
/// - Batch: one POST per route carrying a JSON array; all or nothing
#[derive(Clone)]
pub struct Uploader {
    fetcher: Fetcher,
    url: String,
    routes: HashMap<String, String>,
    policy: DeliveryPolicy,
}

/// Outcome of one upload call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl UploadReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

impl Uploader {
    pub fn new(transport: Arc<dyn HttpTransport>, cfg: &SinkConfig) -> Self {
        let policy = RetryPolicy {
            attempts: cfg.retries.max(1),
            backoff: Backoff::Linear {
                base: Duration::from_millis(cfg.delay_ms),
            },
        };

        Self {
            fetcher: Fetcher::for_sink(transport, policy),
            url: cfg.url.clone(),
            routes: cfg.routes.clone(),
            policy: cfg.policy,
        }
    }

    fn url_for(&self, record: &CanonicalRecord) -> &str {
        record
            .route_key()
            .and_then(|key| self.routes.get(key))
            .map_or(self.url.as_str(), String::as_str)
    }

    pub async fn upload(&self, records: &[CanonicalRecord]) -> UploadReport {
        if records.is_empty() {
            info!("No new entries to upload");
            return UploadReport::default();
        }

        let report = match self.policy {
            DeliveryPolicy::PerRecord => self.upload_each(records).await,
            DeliveryPolicy::Batch => self.upload_batches(records).await,
        };

        METRICS
            .records_delivered
            .fetch_add(report.delivered, Ordering::Relaxed);
        METRICS
            .delivery_failures
            .fetch_add(report.failed, Ordering::Relaxed);

        if report.success() {
            info!("Upload completed: {} delivered", report.delivered);
        } else {
            error!(
                "Upload incomplete: {} delivered, {} failed",
                report.delivered, report.failed
            );
        }
        report
    }

    async fn upload_each(&self, records: &[CanonicalRecord]) -> UploadReport {
        let mut report = UploadReport::default();

        for record in records {
            report.attempted += 1;

            let body = match serde_json::to_value(record) {
                Ok(body) => body,
                Err(e) => {
                    error!("Cannot serialize {}: {}", record.label(), e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.post(self.url_for(record), body).await {
                Ok(()) => {
                    info!("Uploaded {} successfully", record.label());
                    report.delivered += 1;
                }
                Err(e) => {
                    error!("Failed to upload {}: {}", record.label(), e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn upload_batches(&self, records: &[CanonicalRecord]) -> UploadReport {
        let mut report = UploadReport::default();

        // BTreeMap keeps the route order stable across runs.
        let mut batches: BTreeMap<&str, Vec<&CanonicalRecord>> = BTreeMap::new();
        for record in records {
            batches.entry(self.url_for(record)).or_default().push(record);
        }

        for (url, batch) in batches {
            report.attempted += batch.len();

            let body = match serde_json::to_value(&batch) {
                Ok(body) => body,
                Err(e) => {
                    error!("Cannot serialize batch for {}: {}", url, e);
                    report.failed += batch.len();
                    continue;
                }
            };

            match self.post(url, body).await {
                Ok(()) => {
                    info!("Uploaded {} entries to {}", batch.len(), url);
                    report.delivered += batch.len();
                }
                Err(e) => {
                    warn!("Batch of {} to {} failed: {}", batch.len(), url, e);
                    report.failed += batch.len();
                }
            }
        }

        report
    }

    async fn post(&self, url: &str, body: Value) -> Result<(), crate::fetcher::FetchError> {
        let request = HttpRequest::post(url, Body::Json(body));
        self.fetcher.fetch(&request).await.map(|_| ())
    }
}
