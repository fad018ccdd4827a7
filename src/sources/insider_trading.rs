use async_trait::async_trait;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::fetcher::{Body, FetchError, Fetcher, HttpRequest};
use crate::schema::{FetchDescriptor, RawRecord, SourceKind};
use crate::util;

use super::adapter::SourceAdapter;

pub const FORM_URL: &str = "https://www.bseindia.com/corporates/Insider_Trading_new.aspx";

const EVENT_TARGET: (&str, &str) = ("__EVENTTARGET", "ctl00$ContentPlaceHolder1$lnkDownload");
const FROM_FIELD: &str = "ctl00$ContentPlaceHolder1$fmdate";
const TO_FIELD: &str = "ctl00$ContentPlaceHolder1$eddate";
const CURRENT_DATE_FIELD: &str = "ctl00$ContentPlaceHolder1$hidCurrentDate";

/// Form sessions opened per page before giving up on an expired one
const SESSION_ATTEMPTS: u32 = 2;

/// Insider trading disclosures adapter
///
/// CSV download behind an ASP.NET form:
/// 1. GET the form page, keep its hidden inputs and cookies
/// 2. POST the form back with the download target and date range
/// 3. The response body is a headed CSV document
///
/// A POST answered with a session-expiry status is never replayed with
/// the same cookie and form tokens. The form is loaded again and the
/// download retried under the new session.
///
/// Covers today and the six preceding days.
pub struct InsiderTradingAdapter {
    form_url: String,
}

impl InsiderTradingAdapter {
    pub fn new(form_url: impl Into<String>) -> Self {
        Self {
            form_url: form_url.into(),
        }
    }
}

impl Default for InsiderTradingAdapter {
    fn default() -> Self {
        Self::new(FORM_URL)
    }
}

static INPUT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("static regex"));
static HIDDEN_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\btype\s*=\s*["']?hidden\b"#).expect("static regex"));
static NAME_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bname\s*=\s*"([^"]*)""#).expect("static regex"));
static VALUE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bvalue\s*=\s*"([^"]*)""#).expect("static regex"));

/// Name/value pairs of every hidden `<input>` in an HTML document.
pub fn hidden_fields(html: &str) -> Vec<(String, String)> {
    INPUT_TAG
        .find_iter(html)
        .map(|m| m.as_str())
        .filter(|tag| HIDDEN_TYPE.is_match(tag))
        .filter_map(|tag| {
            let name = NAME_ATTR.captures(tag)?.get(1)?.as_str().to_string();
            let value = VALUE_ATTR
                .captures(tag)
                .and_then(|c| c.get(1))
                .map(|m| unescape(m.as_str()))
                .unwrap_or_default();
            Some((name, value))
        })
        .collect()
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Hidden fields with the download target and date range forced in.
fn download_form(html: &str, descriptor: &FetchDescriptor) -> Vec<(String, String)> {
    let mut fields = hidden_fields(html);

    let required = [
        (EVENT_TARGET.0, EVENT_TARGET.1.to_string()),
        (FROM_FIELD, util::compact_date(descriptor.from)),
        (TO_FIELD, util::compact_date(descriptor.to)),
        (CURRENT_DATE_FIELD, util::slashed_date(descriptor.to)),
    ];

    for (name, value) in required {
        match fields.iter_mut().find(|(k, _)| k == name) {
            Some(field) => field.1 = value,
            None => {
                warn!("Missing required field {} in form data", name);
                fields.push((name.to_string(), value));
            }
        }
    }

    fields
}

#[async_trait]
impl SourceAdapter for InsiderTradingAdapter {
    fn name(&self) -> &'static str {
        "insider_trading"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::InsiderTrading
    }

    fn window_days(&self) -> u32 {
        6
    }

    async fn fetch_page(
        &self,
        fetcher: &Fetcher,
        descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let mut session = 1;
        loop {
            match self.download(fetcher, descriptor).await {
                Err(e) if e.is_session_expiry() && session < SESSION_ATTEMPTS => {
                    warn!("Form session expired ({}), reloading form", e);
                    session += 1;
                }
                result => return result,
            }
        }
    }
}

impl InsiderTradingAdapter {
    /// One form session: load the form, post it back, parse the CSV.
    async fn download(
        &self,
        fetcher: &Fetcher,
        descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let form_page = fetcher
            .fetch(&HttpRequest::get(&self.form_url).headers(util::DOCUMENT_HEADERS))
            .await?;

        let fields = download_form(&form_page.body, descriptor);

        let mut download = HttpRequest::post(&self.form_url, Body::Form(fields))
            .headers(util::DOCUMENT_HEADERS)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Referer", self.form_url.clone());
        if let Some(cookies) = form_page.cookie_header() {
            download = download.header("Cookie", cookies);
        }

        fetcher
            .fetch_session_bound(&download, |r| util::csv_rows(&r.body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{Backoff, HttpResponse, Method, RetryPolicy};
    use crate::mocks::MockTransport;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    const FORM: &str = r#"
        <form method="post">
          <input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="dDwtMTA4&amp;=" />
          <INPUT TYPE="HIDDEN" NAME="__EVENTVALIDATION" VALUE="/wEWAgL" >
          <input type="text" name="ctl00$ContentPlaceHolder1$txtName" value="visible" />
          <input type="hidden" name="ctl00$ContentPlaceHolder1$fmdate" value="" />
        </form>"#;

    fn form_page(session: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: vec![(
                "set-cookie".into(),
                format!("ASP.NET_SessionId={}; path=/", session),
            )],
            body: FORM.into(),
        }
    }

    fn fetcher(mock: &Arc<MockTransport>, attempts: u32) -> Fetcher {
        Fetcher::new(
            mock.clone(),
            RetryPolicy {
                attempts,
                backoff: Backoff::Linear {
                    base: Duration::ZERO,
                },
            },
        )
    }

    fn cookie(request: &HttpRequest) -> Option<&str> {
        request
            .headers
            .iter()
            .find(|(k, _)| k == "Cookie")
            .map(|(_, v)| v.as_str())
    }

    fn window() -> FetchDescriptor {
        FetchDescriptor::first_page(
            NaiveDate::from_ymd_opt(2025, 2, 27).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
        )
    }

    #[test]
    fn extracts_only_hidden_inputs() {
        let fields = hidden_fields(FORM);

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], ("__VIEWSTATE".to_string(), "dDwtMTA4&=".to_string()));
        assert_eq!(fields[1].0, "__EVENTVALIDATION");
    }

    #[test]
    fn download_form_forces_target_and_dates() {
        let fields = download_form(FORM, &window());
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get(FROM_FIELD), "20250227");
        assert_eq!(get(TO_FIELD), "20250305");
        assert_eq!(get(CURRENT_DATE_FIELD), "2025/03/05");
        assert_eq!(get("__EVENTTARGET"), "ctl00$ContentPlaceHolder1$lnkDownload");
        assert_eq!(fields.iter().filter(|(k, _)| k == FROM_FIELD).count(), 1);
    }

    #[tokio::test]
    async fn posts_form_with_replayed_cookies() {
        // The POST goes to the same URL; the CSV is queued after the form page.
        let mock = Arc::new(
            MockTransport::new()
                .respond_with(
                    FORM_URL,
                    HttpResponse {
                        status: 200,
                        headers: vec![(
                            "set-cookie".into(),
                            "ASP.NET_SessionId=s1; path=/".into(),
                        )],
                        body: FORM.into(),
                    },
                )
                .respond(FORM_URL, 200, "Security Code,Security Name\n500001,ACME\n"),
        );
        let fetcher = Fetcher::new(
            mock.clone(),
            RetryPolicy {
                attempts: 1,
                backoff: Backoff::Linear {
                    base: Duration::ZERO,
                },
            },
        );

        let rows = InsiderTradingAdapter::default()
            .fetch_page(&fetcher, &window())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Security Name"], "ACME");

        let requests = mock.requests();
        assert_eq!(requests[1].method, Method::Post);
        assert!(
            requests[1]
                .headers
                .contains(&("Cookie".to_string(), "ASP.NET_SessionId=s1".to_string()))
        );
    }

    #[tokio::test]
    async fn expired_session_reloads_form_before_posting_again() {
        let mock = Arc::new(
            MockTransport::new()
                .respond_with(FORM_URL, form_page("s1"))
                .respond(FORM_URL, 401, "")
                .respond_with(FORM_URL, form_page("s2"))
                .respond(FORM_URL, 200, "Security Code,Security Name\n500001,ACME\n"),
        );

        let rows = InsiderTradingAdapter::default()
            .fetch_page(&fetcher(&mock, 3), &window())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let requests = mock.requests();
        let methods: Vec<Method> = requests.iter().map(|r| r.method).collect();
        assert_eq!(
            methods,
            vec![Method::Get, Method::Post, Method::Get, Method::Post]
        );
        assert_eq!(cookie(&requests[1]), Some("ASP.NET_SessionId=s1"));
        assert_eq!(cookie(&requests[3]), Some("ASP.NET_SessionId=s2"));
    }

    #[tokio::test]
    async fn session_reloads_are_bounded() {
        let mock = Arc::new(
            MockTransport::new()
                .respond_with(FORM_URL, form_page("s1"))
                .respond(FORM_URL, 440, "")
                .respond_with(FORM_URL, form_page("s2"))
                .respond(FORM_URL, 440, ""),
        );

        let err = InsiderTradingAdapter::default()
            .fetch_page(&fetcher(&mock, 3), &window())
            .await
            .unwrap_err();

        assert!(err.is_session_expiry());
        assert!(err.is_transient());
        assert_eq!(mock.calls_to(FORM_URL), 4);
    }
}
