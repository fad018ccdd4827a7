//! Raw record → canonical record mapping.
//!
//! Everything in here is pure: no I/O, no clock, no shared state.
//! Missing or blank fields become empty strings; only a missing
//! identifying field (or an unparseable date) skips a record.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::schema::{
    Announcement, CanonicalRecord, HighLowMark, HighMark, InsiderTrade, LowMark, Mark, RawRecord,
    SourceKind, VolumeSpurt,
};

pub const EXCHANGE: &str = "bse";

/// Base URL attachments are published under.
pub const ATTACHMENT_BASE_URL: &str = "https://www.bseindia.com/xml-data/corpfiling/AttachLive/";

/// Column carrying the high/low flag, injected by the high/low adapter.
pub const MARK_FLAG_FIELD: &str = "HLflag";

/// Outcome of normalizing one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Accepted(CanonicalRecord),
    Skipped(String),
}

pub fn normalize(raw: &RawRecord, kind: SourceKind) -> Normalized {
    let result = match kind {
        SourceKind::Announcements => announcement(raw).map(CanonicalRecord::Announcement),
        SourceKind::InsiderTrading => insider_trade(raw).map(CanonicalRecord::InsiderTrade),
        SourceKind::HighLow => high_low(raw).map(CanonicalRecord::HighLow),
        SourceKind::Volume => volume(raw).map(CanonicalRecord::Volume),
    };

    match result {
        Ok(record) => Normalized::Accepted(record),
        Err(reason) => Normalized::Skipped(reason),
    }
}

/// Reads a scalar field as trimmed text; absent/null/non-scalar → "".
fn text(raw: &RawRecord, key: &str) -> String {
    match raw.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn required(raw: &RawRecord, key: &str, context: impl FnOnce() -> String) -> Result<String, String> {
    let value = text(raw, key);
    if value.is_empty() {
        Err(format!("empty {} ({})", key, context()))
    } else {
        Ok(value)
    }
}

// ------------------------------------------------------------
// Announcements
// ------------------------------------------------------------

fn announcement(raw: &RawRecord) -> Result<Announcement, String> {
    let news_id = text(raw, "NEWSID");
    let company_name = required(raw, "SLONGNAME", || format!("NEWSID {}", news_id))?;

    let attachment_name = text(raw, "ATTACHMENTNAME");
    let attachment = (!attachment_name.is_empty())
        .then(|| format!("{}{}", ATTACHMENT_BASE_URL, attachment_name));

    let more = text(raw, "MORE");
    let detail = if more.is_empty() {
        text(raw, "HEADLINE").trim_end_matches('.').to_string()
    } else {
        more
    };

    let headline = text(raw, "NEWSSUB");

    let mut record = Announcement {
        sub_type: headline.clone(),
        headline,
        detail,
        symbol: text(raw, "SCRIP_CD"),
        broadcast_date_time: text(raw, "DissemDT"),
        is_attachment_empty: attachment.is_none(),
        attachment,
        news_type: text(raw, "CATEGORYNAME"),
        sub_cat_type: text(raw, "SUBCATNAME"),
        exchange: EXCHANGE.to_string(),
        company_name,
        audio_video_file: text(raw, "AUDIO_VIDEO_FILE"),
        news_id,
        ns_url: text(raw, "NSURL"),
    };

    apply_headline_segments(&mut record);
    categorize(&mut record);
    Ok(record)
}

static HEADLINE_DELIMITER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s-\s").expect("static regex"));

/// Splits "Company - Symbol - Subtype..." headlines into their parts.
///
/// - first segment → company name, unless it starts with '-'
/// - second segment → symbol
/// - remaining segments joined with spaces → sub type
///
/// Without the delimiter the record is left untouched.
pub fn apply_headline_segments(record: &mut Announcement) {
    let parts: Vec<&str> = HEADLINE_DELIMITER.split(&record.headline).collect();
    if parts.len() < 2 {
        return;
    }

    let company = parts[0].trim();
    if !parts[0].starts_with('-') && !company.is_empty() {
        record.company_name = company.to_string();
    }

    record.symbol = parts[1].trim().to_string();

    if parts.len() > 2 {
        record.sub_type = parts[2..].join(" ").trim().to_string();
    }
}

// ------------------------------------------------------------
// Announcement category table
// ------------------------------------------------------------
//
// Evaluated top to bottom, first match wins. A rule matches when any
// of its conditions holds.
//

enum Condition {
    DetailContains(&'static str),
    DetailContainsIgnoreCase(&'static str),
    SubCategoryIn(&'static [&'static str]),
    CategoryIn(&'static [&'static str]),
}

enum Assignment {
    /// Set both category and sub-category
    Both(&'static str),
    /// Promote the sub-category to category
    PromoteSubCategory,
    Category(&'static str),
}

struct CategoryRule {
    any_of: &'static [Condition],
    assign: Assignment,
}

const EARNINGS_CALL_TRANSCRIPT: &str = "Earnings Call Transcript";
const AUDIO_RECORDING: &str = "Audio Recording";
pub const DEFAULT_CATEGORY: &str = "Others";

const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        any_of: &[Condition::DetailContains("Transcript")],
        assign: Assignment::Both(EARNINGS_CALL_TRANSCRIPT),
    },
    CategoryRule {
        any_of: &[Condition::DetailContainsIgnoreCase("audio recording")],
        assign: Assignment::Both(AUDIO_RECORDING),
    },
    CategoryRule {
        any_of: &[Condition::SubCategoryIn(&[
            "Postal Ballot",
            "Allotment of ESOP / ESPS",
            "Allotment of Equity Shares",
            "Analyst / Investor Meet",
            "New Listing",
            "Publication",
        ])],
        assign: Assignment::PromoteSubCategory,
    },
    CategoryRule {
        any_of: &[
            Condition::SubCategoryIn(&["Investor Presentation", "Reg. 34 (1) Annual Report"]),
            Condition::CategoryIn(&[EARNINGS_CALL_TRANSCRIPT, AUDIO_RECORDING]),
        ],
        assign: Assignment::Category("Analytical Updates"),
    },
];

impl Condition {
    fn holds(&self, record: &Announcement) -> bool {
        match self {
            Condition::DetailContains(needle) => record.detail.contains(needle),
            Condition::DetailContainsIgnoreCase(needle) => {
                record.detail.to_lowercase().contains(needle)
            }
            Condition::SubCategoryIn(values) => values.contains(&record.sub_cat_type.as_str()),
            Condition::CategoryIn(values) => values.contains(&record.news_type.as_str()),
        }
    }
}

pub fn categorize(record: &mut Announcement) {
    let rule = CATEGORY_RULES
        .iter()
        .find(|rule| rule.any_of.iter().any(|c| c.holds(record)));

    match rule.map(|r| &r.assign) {
        Some(Assignment::Both(value)) => {
            record.news_type = value.to_string();
            record.sub_cat_type = value.to_string();
        }
        Some(Assignment::PromoteSubCategory) => {
            record.news_type = record.sub_cat_type.clone();
        }
        Some(Assignment::Category(value)) => {
            record.news_type = value.to_string();
        }
        None if record.news_type.is_empty() => {
            record.news_type = DEFAULT_CATEGORY.to_string();
        }
        None => {}
    }
}

// ------------------------------------------------------------
// Insider trading (CSV rows)
// ------------------------------------------------------------

mod insider_columns {
    pub const CODE: &str = "Security Code";
    pub const NAME: &str = "Security Name";
    pub const PERSON: &str = "Name of Person";
    pub const CATEGORY: &str = "Category of person";
    pub const HELD_PRIOR: &str = "Number of Securities held Prior to acquisition/Disposed";
    pub const HELD_PRIOR_PCT: &str = "%   of  Securities held Prior to acquisition/Disposed";
    pub const SECURITY_TYPE: &str = "Type of Securities Acquired/Disposed/Pledge etc.";
    pub const NUMBER: &str = "Number of Securities Acquired/Disposed/Pledge etc.";
    pub const VALUE: &str = "Value  of Securities Acquired/Disposed/Pledge etc";
    pub const TRANSACTION: &str = "Transaction Type ( Buy/Sale/Pledge/Revoke/Invoke)";
    pub const HELD_POST: &str = "Number of Securities held Post  acquisition/Disposed/Pledge etc";
    pub const HELD_POST_PCT: &str = "Post-Transaction % of Shareholding";
    pub const FROM_DATE: &str =
        "Date of acquisition of shares/sale of shares/Date of Allotment(From date)";
    pub const TO_DATE: &str =
        "Date of acquisition of shares/sale of shares/Date of Allotment( To date  )";
    pub const MODE: &str = "Mode of Acquisition";
    pub const REPORTED: &str = "Reported to Exchange";
}

/// "05 Mar 2025" → "05/03/2025"; empty stays empty.
pub fn slash_date(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(String::new());
    }
    NaiveDate::parse_from_str(value, "%d %b %Y")
        .map(|d| d.format("%d/%m/%Y").to_string())
        .map_err(|_| format!("unparseable date '{}'", value))
}

fn insider_trade(raw: &RawRecord) -> Result<InsiderTrade, String> {
    use insider_columns::*;

    let symbol = text(raw, CODE);
    let company_name = required(raw, NAME, || format!("security code {}", symbol))?;

    let from = slash_date(&text(raw, FROM_DATE))?;
    let to = slash_date(&text(raw, TO_DATE))?;
    let reported = slash_date(&text(raw, REPORTED))?;

    Ok(InsiderTrade {
        symbol,
        company_name,
        name_of_person: text(raw, PERSON),
        category_of_person: text(raw, CATEGORY),
        security_held_per_transaction: format!(
            "{} ({})",
            text(raw, HELD_PRIOR),
            text(raw, HELD_PRIOR_PCT)
        ),
        type_of_securities: text(raw, SECURITY_TYPE),
        number: text(raw, NUMBER),
        value: text(raw, VALUE),
        transaction_type: text(raw, TRANSACTION),
        securities_held_post_transaction: format!(
            "{} ({})",
            text(raw, HELD_POST),
            text(raw, HELD_POST_PCT)
        ),
        period: format!("{} to {}", from, to),
        mode_of_acquisition: text(raw, MODE),
        reported_to_exchange: reported,
        exchange: EXCHANGE.to_string(),
    })
}

// ------------------------------------------------------------
// 52-week high / low (CSV rows)
// ------------------------------------------------------------

struct MarkColumns {
    name: &'static str,
    code: &'static str,
    previous_value: &'static str,
    previous_date: &'static str,
    new_value: &'static str,
    all_time_price: &'static str,
    all_time_date: &'static str,
}

const HIGH_COLUMNS: MarkColumns = MarkColumns {
    name: "Security Name",
    code: "Security Code",
    previous_value: "Previous 52 Weeks High",
    previous_date: "Previous 52 Weeks High Date",
    new_value: "52 Weeks High",
    all_time_price: "All Time High Price",
    all_time_date: "All Time High Date",
};

const LOW_COLUMNS: MarkColumns = MarkColumns {
    name: "Scrip Name",
    code: "Scrip Code",
    previous_value: "Previous 52 Weeks Low",
    previous_date: "Previous 52 Weeks Low Date",
    new_value: "52 Weeks Low",
    all_time_price: "All Time Low Price",
    all_time_date: "All Time Low Date",
};

fn high_low(raw: &RawRecord) -> Result<HighLowMark, String> {
    let flag = text(raw, MARK_FLAG_FIELD);
    let mark = Mark::from_flag(&flag).ok_or_else(|| format!("unknown high/low flag '{}'", flag))?;
    let cols = match mark {
        Mark::High => &HIGH_COLUMNS,
        Mark::Low => &LOW_COLUMNS,
    };

    let bse_code = text(raw, cols.code);
    let symbol = required(raw, cols.name, || format!("code {}", bse_code))?;

    let current_price = text(raw, "LTP");
    let previous = text(raw, cols.previous_value);
    let previous_date = text(raw, cols.previous_date);
    let new_value = text(raw, cols.new_value);
    let all_time = format!(
        "{}{}",
        text(raw, cols.all_time_price),
        text(raw, cols.all_time_date)
    );
    let group = text(raw, "Group");
    let exchange = EXCHANGE.to_string();

    Ok(match mark {
        Mark::High => HighLowMark::High(HighMark {
            current_price,
            previous_high: previous,
            previous_high_date: previous_date,
            new_high: new_value,
            all_time_high: all_time,
            symbol,
            bse_code,
            group,
            exchange,
        }),
        Mark::Low => HighLowMark::Low(LowMark {
            current_price,
            previous_low: previous,
            previous_low_date: previous_date,
            new_low: new_value,
            all_time_low: all_time,
            symbol,
            bse_code,
            group,
            exchange,
        }),
    })
}

// ------------------------------------------------------------
// Volume spurts (JSON rows)
// ------------------------------------------------------------

fn volume(raw: &RawRecord) -> Result<VolumeSpurt, String> {
    let symbol = text(raw, "scrip_cd");
    let company = required(raw, "scripname", || format!("scrip_cd {}", symbol))?;

    Ok(VolumeSpurt {
        symbol,
        company,
        today_volume: text(raw, "Trd_vol"),
        two_week_avg_volume: text(raw, "wkavgqty"),
        volume_change: text(raw, "volumechangetimes"),
        turnover: text(raw, "TurnOver"),
        change: text(raw, "change_val"),
        ltp: text(raw, "Ltradert"),
        change_per: text(raw, "change_percent"),
        exchange: EXCHANGE.to_string(),
    })
}
