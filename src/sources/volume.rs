use async_trait::async_trait;
use serde_json::Value;

use crate::fetcher::{FetchError, Fetcher, HttpRequest};
use crate::schema::{FetchDescriptor, RawRecord, SourceKind};
use crate::util;

use super::adapter::SourceAdapter;

pub const BASE_URL: &str = "https://api.bseindia.com/BseIndiaAPI/api/SpurtvolumeNew/w";

/// Volume spurt adapter
///
/// Single JSON document, no pagination. The body is normally a bare
/// array; a `{"Table": [...]}` wrapper is accepted as well.
pub struct VolumeAdapter {
    base_url: String,
}

impl VolumeAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for VolumeAdapter {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

fn parse_rows(value: &Value) -> Result<Vec<RawRecord>, String> {
    match value {
        Value::Array(_) => Ok(util::object_rows(value)),
        Value::Object(map) => Ok(map.get("Table").map(util::object_rows).unwrap_or_default()),
        other => Err(format!("unexpected volume payload: {}", other)),
    }
}

#[async_trait]
impl SourceAdapter for VolumeAdapter {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Volume
    }

    async fn fetch_page(
        &self,
        fetcher: &Fetcher,
        _descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let request = HttpRequest::get(&self.base_url)
            .headers(util::API_HEADERS)
            .query("flag", "1");
        let value = fetcher.fetch_json(&request).await?;
        parse_rows(&value).map_err(FetchError::Malformed)
    }
}
