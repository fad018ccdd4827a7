use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw record as produced by a source adapter.
///
/// Adapters do not interpret upstream payloads beyond splitting them into
/// rows; every row is a string-keyed map (JSON object or CSV row with
/// headers). Interpretation happens in the normalizer.
pub type RawRecord = Map<String, Value>;

/// Upstream feed a raw record came from; selects the normalization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Announcements,
    InsiderTrading,
    HighLow,
    Volume,
}

/// Central record enum used across the ingestion pipeline.
///
/// This is the canonical shape that is:
/// - persisted in day-window files
/// - used as dedup identity
/// - forwarded to the sink
///
/// The `kind` field is added by serde and lets a window file be read back
/// without knowing which source wrote it.
///
/// IMPORTANT:
/// - The ingestion wall-clock time is deliberately NOT a field here.
///   Identity is the full field set, so any per-fetch value would make
///   every re-fetched record look new.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Announcement(Announcement),
    InsiderTrade(InsiderTrade),
    HighLow(HighLowMark),
    Volume(VolumeSpurt),
}

impl CanonicalRecord {
    /// Stable, field-order independent serialization of the record.
    ///
    /// `serde_json::Value` objects are backed by a sorted map, so going
    /// through `to_value` yields the same string regardless of struct
    /// field order or the key order a record was read back with.
    pub fn identity(&self) -> String {
        match serde_json::to_value(self) {
            Ok(value) => value.to_string(),
            Err(_) => format!("{:?}", self),
        }
    }

    /// Key used by the uploader to pick a sink route.
    pub fn route_key(&self) -> Option<&'static str> {
        match self {
            CanonicalRecord::HighLow(mark) => Some(mark.mark().as_str()),
            _ => None,
        }
    }

    /// Short human-readable label for log lines.
    pub fn label(&self) -> &str {
        match self {
            CanonicalRecord::Announcement(a) => &a.company_name,
            CanonicalRecord::InsiderTrade(t) => &t.symbol,
            CanonicalRecord::HighLow(m) => m.symbol(),
            CanonicalRecord::Volume(v) => &v.company,
        }
    }
}

// ------------------------------------------------------------
// Corporate announcement
// ------------------------------------------------------------
//
// Field names follow the announcement feed's downstream contract
// (upper snake case).
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Announcement {
    pub headline: String,
    pub detail: String,
    pub symbol: String,
    pub broadcast_date_time: String,
    /// Absolute URL of the filing attachment, if any
    pub attachment: Option<String>,
    pub news_type: String,
    pub sub_cat_type: String,
    pub exchange: String,
    pub company_name: String,
    pub audio_video_file: String,
    pub sub_type: String,
    pub news_id: String,
    pub ns_url: String,
    #[serde(rename = "isAttachmentEmpty")]
    pub is_attachment_empty: bool,
}

// ------------------------------------------------------------
// Insider trading disclosure
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InsiderTrade {
    pub symbol: String,
    pub company_name: String,
    pub name_of_person: String,
    pub category_of_person: String,
    /// "<count> (<percent>)" held before the transaction
    pub security_held_per_transaction: String,
    pub type_of_securities: String,
    pub number: String,
    pub value: String,
    pub transaction_type: String,
    /// "<count> (<percent>)" held after the transaction
    pub securities_held_post_transaction: String,
    /// "DD/MM/YYYY to DD/MM/YYYY"
    pub period: String,
    #[serde(rename = "modeOfAquisition")]
    pub mode_of_acquisition: String,
    pub reported_to_exchange: String,
    pub exchange: String,
}

// ------------------------------------------------------------
// 52-week high / low mark
// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    High,
    Low,
}

impl Mark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::High => "high",
            Mark::Low => "low",
        }
    }

    /// Upstream query flag for this mark.
    pub fn flag(&self) -> &'static str {
        match self {
            Mark::High => "H",
            Mark::Low => "L",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Mark> {
        match flag {
            "H" => Some(Mark::High),
            "L" => Some(Mark::Low),
            _ => None,
        }
    }
}

/// One 52-week mark, tagged with `type: "high" | "low"`.
///
/// The two marks carry the same data under mark-specific keys
/// (`previousHigh` vs `previousLow`, ...), which is what the per-mark
/// sink routes consume.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HighLowMark {
    High(HighMark),
    Low(LowMark),
}

impl HighLowMark {
    pub fn mark(&self) -> Mark {
        match self {
            HighLowMark::High(_) => Mark::High,
            HighLowMark::Low(_) => Mark::Low,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            HighLowMark::High(m) => &m.symbol,
            HighLowMark::Low(m) => &m.symbol,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HighMark {
    pub current_price: String,
    pub previous_high: String,
    pub previous_high_date: String,
    pub new_high: String,
    /// Price immediately followed by date
    pub all_time_high: String,
    pub symbol: String,
    pub bse_code: String,
    pub group: String,
    pub exchange: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LowMark {
    pub current_price: String,
    pub previous_low: String,
    pub previous_low_date: String,
    pub new_low: String,
    /// Price immediately followed by date
    pub all_time_low: String,
    pub symbol: String,
    pub bse_code: String,
    pub group: String,
    pub exchange: String,
}

// ------------------------------------------------------------
// Volume spurt
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpurt {
    pub symbol: String,
    pub company: String,
    pub today_volume: String,
    pub two_week_avg_volume: String,
    pub volume_change: String,
    pub turnover: String,
    pub change: String,
    pub ltp: String,
    pub change_per: String,
    pub exchange: String,
}

// ------------------------------------------------------------
// Fetch descriptor
// ------------------------------------------------------------
//
// The addressable unit of one upstream call: a 1-based page index plus
// the inclusive date range the page covers.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchDescriptor {
    pub page: u32,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl FetchDescriptor {
    pub fn first_page(from: NaiveDate, to: NaiveDate) -> Self {
        Self { page: 1, from, to }
    }

    pub fn with_page(self, page: u32) -> Self {
        Self { page, ..self }
    }
}
