use async_trait::async_trait;
use log::warn;
use serde_json::Value;

use crate::fetcher::{FetchError, Fetcher, HttpRequest};
use crate::normalizer::MARK_FLAG_FIELD;
use crate::schema::{FetchDescriptor, Mark, RawRecord, SourceKind};
use crate::util;

use super::adapter::SourceAdapter;

pub const BASE_URL: &str = "https://api.bseindia.com/BseIndiaAPI/api/HLDownloadCSVNew/w";

/// 52-week high / low adapter
///
/// Two CSV downloads per fetch, one per mark. The column layout differs
/// between the two, so every row is tagged with its flag before it
/// leaves the adapter.
///
/// A transient failure on one mark does not discard the other.
pub struct HighLowAdapter {
    base_url: String,
}

impl HighLowAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn request(&self, mark: Mark) -> HttpRequest {
        HttpRequest::get(&self.base_url)
            .headers(util::API_HEADERS)
            .query("scripcode", "")
            .query("Grpcode", "")
            .query("indexcode", "")
            .query("EQflag", "1")
            .query("HLflag", mark.flag())
    }
}

impl Default for HighLowAdapter {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

#[async_trait]
impl SourceAdapter for HighLowAdapter {
    fn name(&self) -> &'static str {
        "high_low"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HighLow
    }

    async fn fetch_page(
        &self,
        fetcher: &Fetcher,
        _descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let mut rows = Vec::new();

        for mark in [Mark::High, Mark::Low] {
            let request = self.request(mark);
            match fetcher.fetch_with(&request, |r| util::csv_rows(&r.body)).await {
                Ok(marks) => rows.extend(marks.into_iter().map(|mut row| {
                    row.insert(MARK_FLAG_FIELD.to_string(), Value::from(mark.flag()));
                    row
                })),
                Err(e) if e.is_transient() => {
                    warn!("No {} data this tick: {}", mark.as_str(), e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(rows)
    }
}
