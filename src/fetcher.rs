use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use rand::random_range;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{BackoffKind, HttpConfig, ProxyConfig, RetryConfig};
use crate::metrics::{METRICS, RuntimeMetrics};
use std::sync::atomic::{AtomicUsize, Ordering};

// ------------------------------------------------------------
// Request / response model
// ------------------------------------------------------------
//
// The fetcher is adapter-agnostic: adapters describe a call with
// method, URL, headers, query and body, and get back status,
// headers and body text. Nothing here knows about any upstream schema.
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Body) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn headers(mut self, headers: &[(&str, &str)]) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// One-line description used in log messages.
    pub fn describe(&self) -> String {
        let method = match self.method {
            Method::Get => "GET",
            Method::Post => "POST",
        };
        format!("{} {}", method, self.url)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// All values of a header, case-insensitive.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Builds a `Cookie` header value replaying every `Set-Cookie`
    /// received on this response (name=value pairs only).
    pub fn cookie_header(&self) -> Option<String> {
        let pairs: Vec<&str> = self
            .header_values("set-cookie")
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

// ------------------------------------------------------------
// Errors
// ------------------------------------------------------------

#[derive(Error, Debug)]
pub enum FetchError {
    /// Client-side rejection, retrying will not help.
    #[error("request rejected with status {status}: {url}")]
    Rejected { status: u16, url: String },

    /// Server-side or session failure, worth another attempt.
    #[error("server returned status {status}: {url}")]
    Status { status: u16, url: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed body: {0}")]
    Malformed(String),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// True when the failure should degrade to "no data this tick".
    ///
    /// Only a non-retriable rejection surfaces as a tick-level failure.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Rejected { .. } => false,
            FetchError::Exhausted { last, .. } => last.is_transient(),
            _ => true,
        }
    }

    fn is_retriable(&self) -> bool {
        !matches!(self, FetchError::Rejected { .. })
    }

    /// Expired session or cookie; only a fresh session can fix it.
    pub fn is_session_expiry(&self) -> bool {
        matches!(
            self,
            FetchError::Status {
                status: 401 | 419 | 440,
                ..
            }
        )
    }
}

/// Status classification.
///
/// - 5xx: server side, retried
/// - 401 / 419 / 440: expired session or cookie, retried
/// - 408 / 429: timeout / throttling, retried
/// - any other non-2xx: rejected, aborts the retry loop
fn classify_status(status: u16, url: &str) -> FetchError {
    match status {
        500..=599 | 401 | 408 | 419 | 429 | 440 => FetchError::Status {
            status,
            url: url.to_string(),
        },
        _ => FetchError::Rejected {
            status,
            url: url.to_string(),
        },
    }
}

// ------------------------------------------------------------
// Transport
// ------------------------------------------------------------

/// The only thing in the process that talks to the network.
///
/// A transport performs exactly one exchange per call and never
/// retries; retry policy lives in [`Fetcher`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// reqwest-backed transport shared by all fetchers of a source.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: &HttpConfig, proxy: Option<&ProxyConfig>) -> anyhow::Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(http.timeout_secs));

        if let Some(proxy) = proxy {
            if let Some(url) = proxy.http.as_deref().filter(|u| !u.is_empty()) {
                builder = builder.proxy(reqwest::Proxy::http(url)?);
            }
            if let Some(url) = proxy.https.as_deref().filter(|u| !u.is_empty()) {
                builder = builder.proxy(reqwest::Proxy::https(url)?);
            }
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ------------------------------------------------------------
// Retry policy
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uniform random pause in `[min, max]`
    Jitter { min: Duration, max: Duration },

    /// `attempt * base`
    Linear { base: Duration },
}

impl Backoff {
    /// Pause after the given 1-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Jitter { min, max } => {
                if max <= min {
                    return min;
                }
                let ms = random_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(ms)
            }
            Backoff::Linear { base } => base * attempt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of network attempts, at least 1
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let backoff = match cfg.backoff {
            BackoffKind::Jitter => Backoff::Jitter {
                min: Duration::from_millis(cfg.delay_ms / 2),
                max: Duration::from_millis(cfg.delay_ms + cfg.delay_ms / 2),
            },
            BackoffKind::Linear => Backoff::Linear {
                base: Duration::from_millis(cfg.delay_ms),
            },
        };

        Self {
            attempts: cfg.retries.max(1),
            backoff,
        }
    }
}

/// Which side of the pipeline a fetcher talks to.
///
/// Upstream pulls and sink deliveries share the retry loop but are
/// counted and logged apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTarget {
    Upstream,
    Sink,
}

impl RetryTarget {
    pub fn retry_counter<'a>(&self, metrics: &'a RuntimeMetrics) -> &'a AtomicUsize {
        match self {
            RetryTarget::Upstream => &metrics.fetch_retries,
            RetryTarget::Sink => &metrics.delivery_retries,
        }
    }

    fn attempt_label(&self) -> &'static str {
        match self {
            RetryTarget::Upstream => "Attempt",
            RetryTarget::Sink => "Delivery attempt",
        }
    }
}

// ------------------------------------------------------------
// Fetcher
// ------------------------------------------------------------

/// HTTP exchange with bounded retries and backoff.
///
/// Stateless apart from its transport handle; cloning is cheap.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    target: RetryTarget,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            target: RetryTarget::Upstream,
        }
    }

    /// Fetcher for downstream deliveries.
    pub fn for_sink(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            target: RetryTarget::Sink,
            ..Self::new(transport, policy)
        }
    }

    pub fn target(&self) -> RetryTarget {
        self.target
    }

    /// Performs the request and returns the first 2xx response.
    pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.fetch_with(request, |response| Ok(response.clone()))
            .await
    }

    /// Performs the request and parses the body as JSON; an unparseable
    /// body counts as a failed attempt.
    pub async fn fetch_json(&self, request: &HttpRequest) -> Result<Value, FetchError> {
        self.fetch_with(request, |response| {
            serde_json::from_str(&response.body).map_err(|e| e.to_string())
        })
        .await
    }

    /// Core retry loop.
    ///
    /// `validate` turns a 2xx response into the caller's value; an `Err`
    /// from it is treated like a malformed body and retried.
    ///
    /// GUARANTEES:
    /// - never more than `policy.attempts` transport calls
    /// - a rejected status stops immediately
    /// - no pause after the final attempt
    pub async fn fetch_with<T, F>(&self, request: &HttpRequest, validate: F) -> Result<T, FetchError>
    where
        F: Fn(&HttpResponse) -> Result<T, String> + Send + Sync,
        T: Send,
    {
        self.retry_loop(request, &validate, false).await
    }

    /// Same as [`Fetcher::fetch_with`] for requests that carry session
    /// state (cookies, form tokens).
    ///
    /// A session-expiry status is returned at once instead of being
    /// replayed with the same stale request; the caller decides whether
    /// to open a new session.
    pub async fn fetch_session_bound<T, F>(
        &self,
        request: &HttpRequest,
        validate: F,
    ) -> Result<T, FetchError>
    where
        F: Fn(&HttpResponse) -> Result<T, String> + Send + Sync,
        T: Send,
    {
        self.retry_loop(request, &validate, true).await
    }

    async fn retry_loop<T, F>(
        &self,
        request: &HttpRequest,
        validate: &F,
        session_bound: bool,
    ) -> Result<T, FetchError>
    where
        F: Fn(&HttpResponse) -> Result<T, String> + Send + Sync,
        T: Send,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last = FetchError::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            let error = match self.transport.execute(request).await {
                Ok(response) if response.is_success() => match validate(&response) {
                    Ok(value) => return Ok(value),
                    Err(reason) => FetchError::Malformed(reason),
                },
                Ok(response) => classify_status(response.status, &request.url),
                Err(e) => e,
            };

            warn!(
                "{} {}/{} failed ({}): {}",
                self.target.attempt_label(),
                attempt,
                attempts,
                request.describe(),
                error
            );

            if !error.is_retriable() || (session_bound && error.is_session_expiry()) {
                return Err(error);
            }
            last = error;

            if attempt < attempts {
                self.target
                    .retry_counter(&METRICS)
                    .fetch_add(1, Ordering::Relaxed);
                let pause = self.policy.backoff.delay(attempt);
                info!("Waiting {:?} before retry", pause);
                sleep(pause).await;
            }
        }

        Err(FetchError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }
}
