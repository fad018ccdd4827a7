use async_trait::async_trait;
use serde_json::Value;

use crate::fetcher::{FetchError, Fetcher, HttpRequest};
use crate::schema::{FetchDescriptor, RawRecord, SourceKind};
use crate::util;

use super::adapter::SourceAdapter;

pub const BASE_URL: &str = "https://api.bseindia.com/BseIndiaAPI/api/AnnSubCategoryGetData/w";

/// Corporate announcements adapter
///
/// JSON API, paginated:
/// - `Table`: the announcements of the requested page
/// - `Table[0].TotalPageCnt`: page count for the date range
pub struct AnnouncementsAdapter {
    base_url: String,
}

impl AnnouncementsAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn page_request(&self, descriptor: &FetchDescriptor) -> HttpRequest {
        HttpRequest::get(&self.base_url)
            .headers(util::API_HEADERS)
            .query("pageno", descriptor.page.to_string())
            .query("strCat", "-1")
            .query("strPrevDate", util::compact_date(descriptor.from))
            .query("strScrip", "")
            .query("strSearch", "P")
            .query("strToDate", util::compact_date(descriptor.to))
            .query("strType", "C")
            .query("subcategory", "-1")
    }
}

impl Default for AnnouncementsAdapter {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

/// `Table[0].TotalPageCnt`, sent either as a number or a string.
fn parse_page_count(body: &str) -> Result<u32, String> {
    let value: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let count = value.pointer("/Table/0/TotalPageCnt");

    match count {
        // No rows at all: a single (empty) page.
        None if value.get("Table").is_some_and(|t| t.as_array().is_some_and(Vec::is_empty)) => {
            Ok(1)
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| format!("bad page count {}", n)),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| format!("bad page count '{}'", s)),
        _ => Err("missing TotalPageCnt".to_string()),
    }
}

fn parse_rows(body: &str) -> Result<Vec<RawRecord>, String> {
    let value: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    Ok(value.get("Table").map(util::object_rows).unwrap_or_default())
}

#[async_trait]
impl SourceAdapter for AnnouncementsAdapter {
    fn name(&self) -> &'static str {
        "announcements"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Announcements
    }

    fn paginated(&self) -> bool {
        true
    }

    async fn page_count(
        &self,
        fetcher: &Fetcher,
        window: &FetchDescriptor,
    ) -> Result<u32, FetchError> {
        let request = self.page_request(&window.with_page(1));
        let count = fetcher
            .fetch_with(&request, |r| parse_page_count(&r.body))
            .await?;
        Ok(count.max(1))
    }

    async fn fetch_page(
        &self,
        fetcher: &Fetcher,
        descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let request = self.page_request(descriptor);
        fetcher.fetch_with(&request, |r| parse_rows(&r.body)).await
    }
}
