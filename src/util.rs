/// Utility helpers used by all source adapters.
///
/// This module contains:
/// - Shared browser-like request headers
/// - Upstream date formats
/// - Row extraction from JSON and CSV bodies
///
/// IMPORTANT:
/// - No source-specific field mapping lives here; that belongs to
///   the normalizer.
/// - This module must remain lightweight and deterministic.
use chrono::NaiveDate;
use serde_json::Value;

use crate::schema::RawRecord;

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

/// Headers for the exchange's JSON / CSV API endpoints.
pub const API_HEADERS: &[(&str, &str)] = &[
    ("Accept", "application/json, text/plain, */*"),
    ("Accept-Language", "en-GB,en-US;q=0.9,en;q=0.8"),
    ("Origin", "https://www.bseindia.com"),
    ("Referer", "https://www.bseindia.com/"),
    ("User-Agent", USER_AGENT),
    ("sec-ch-ua", "\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\""),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
];

/// Headers for HTML form pages.
pub const DOCUMENT_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("Accept-Language", "en-GB,en-US;q=0.9,en;q=0.8"),
    ("Cache-Control", "max-age=0"),
    ("Origin", "https://www.bseindia.com"),
    ("Upgrade-Insecure-Requests", "1"),
    ("User-Agent", USER_AGENT),
];

/// "20250305"
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// "2025/03/05"
pub fn slashed_date(date: NaiveDate) -> String {
    date.format("%Y/%m/%d").to_string()
}

/// Collects the object elements of a JSON array.
///
/// Non-object elements are dropped; a non-array value yields nothing.
pub fn object_rows(value: &Value) -> Vec<RawRecord> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Parses a headed CSV document into one map per row.
///
/// Cells become JSON strings keyed by their (untrimmed) header. Short
/// rows simply lack the missing columns. An empty body is no rows.
pub fn csv_rows(text: &str) -> Result<Vec<RawRecord>, String> {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("CSV row {}: {}", line + 1, e))?;
        let row: RawRecord = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}
