//! Test doubles shared by the unit tests of several modules.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::fetcher::{FetchError, Fetcher, HttpRequest, HttpResponse, HttpTransport};
use crate::schema::{FetchDescriptor, RawRecord, SourceKind};
use crate::sources::adapter::SourceAdapter;

enum Scripted {
    Response(HttpResponse),
    Failure(String),
}

/// Scripted transport that records calls and replays queued responses.
///
/// Routes are keyed by a prefix of `url?query`; the longest matching
/// prefix wins. Each route replays its queue in order and keeps
/// repeating the last entry once the queue is down to one.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to queue a plain response for a route
    pub fn respond(self, route: &str, status: u16, body: &str) -> Self {
        self.respond_with(
            route,
            HttpResponse {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            },
        )
    }

    pub fn respond_with(self, route: &str, response: HttpResponse) -> Self {
        self.push(route, Scripted::Response(response));
        self
    }

    /// Builder method to queue a transport-level failure for a route
    pub fn fail(self, route: &str, reason: &str) -> Self {
        self.push(route, Scripted::Failure(reason.to_string()));
        self
    }

    fn push(&self, route: &str, entry: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(entry);
    }

    /// Get all recorded calls
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls whose `url?query` starts with `route`
    pub fn calls_to(&self, route: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| full_url(r).starts_with(route))
            .count()
    }
}

fn full_url(request: &HttpRequest) -> String {
    if request.query.is_empty() {
        return request.url.clone();
    }
    let query: Vec<String> = request
        .query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}?{}", request.url, query.join("&"))
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.calls.lock().unwrap().push(request.clone());

        let target = full_url(request);
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .keys()
            .filter(|prefix| target.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .cloned();

        let Some(route) = route else {
            return Err(FetchError::Transport(format!("no mock route for {}", target)));
        };
        let Some(queue) = routes.get_mut(&route) else {
            return Err(FetchError::Transport(format!("no mock route for {}", target)));
        };

        let entry = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().map(|e| match e {
                Scripted::Response(r) => Scripted::Response(r.clone()),
                Scripted::Failure(f) => Scripted::Failure(f.clone()),
            })
        };

        match entry {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Failure(reason)) => Err(FetchError::Transport(reason)),
            None => Err(FetchError::Transport(format!("empty mock route for {}", target))),
        }
    }
}

/// Source adapter serving fixed pages without touching the fetcher.
///
/// Page `n` (1-based) is `pages[n - 1]`; pages past the end are empty.
/// Every page request waits `delay` before answering.
pub struct StaticAdapter {
    pub kind: SourceKind,
    pub paginated: bool,
    pub delay: Duration,
    pub page_count: Result<u32, FetchError>,
    pub pages: Vec<Result<Vec<RawRecord>, FetchError>>,
    served: Mutex<Vec<u32>>,
}

impl StaticAdapter {
    pub fn new(kind: SourceKind, pages: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
        Self {
            kind,
            paginated: pages.len() > 1,
            delay: Duration::ZERO,
            page_count: Ok(pages.len().max(1) as u32),
            pages,
            served: Mutex::new(Vec::new()),
        }
    }

    /// Page numbers requested so far, in order
    pub fn served(&self) -> Vec<u32> {
        self.served.lock().unwrap().clone()
    }
}

fn replay<T: Clone>(result: &Result<T, FetchError>) -> Result<T, FetchError> {
    match result {
        Ok(value) => Ok(value.clone()),
        Err(FetchError::Rejected { status, url }) => Err(FetchError::Rejected {
            status: *status,
            url: url.clone(),
        }),
        Err(e) => Err(FetchError::Transport(e.to_string())),
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn name(&self) -> &'static str {
        "static"
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn paginated(&self) -> bool {
        self.paginated
    }

    async fn page_count(
        &self,
        _fetcher: &Fetcher,
        _window: &FetchDescriptor,
    ) -> Result<u32, FetchError> {
        replay(&self.page_count)
    }

    async fn fetch_page(
        &self,
        _fetcher: &Fetcher,
        descriptor: &FetchDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.served.lock().unwrap().push(descriptor.page);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.pages.get(descriptor.page as usize - 1) {
            Some(page) => replay(page),
            None => Ok(Vec::new()),
        }
    }
}
