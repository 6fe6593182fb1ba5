#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;

use resilient_fetch::external_deps::{BrowserSnapshot, ContextOptions, LaunchProfile};
use resilient_fetch::{
    BlockingBrowser, BrowserDriver, BrowserError, BrowserPage, FetchEvent, EventHandler,
    HttpTransport, TransportError, TransportRequest, TransportResponse,
};

pub fn page_body() -> String {
    format!("<html><body>{}</body></html>", "catalogue entry ".repeat(400))
}

/// Transport replaying a fixed status/body for every call.
pub struct FixedTransport {
    status: u16,
    body: String,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub requests: Mutex<Vec<TransportRequest>>,
}

impl FixedTransport {
    pub fn new(status: u16, body: impl Into<String>) -> Arc<Self> {
        Self::with_delay(status, body, Duration::ZERO)
    }

    pub fn with_delay(status: u16, body: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.into(),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FixedTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let url = request.url.clone();
        self.requests.lock().push(request);
        Ok(TransportResponse {
            status: self.status,
            headers: HeaderMap::new(),
            body: Bytes::from(self.body.clone()),
            url,
        })
    }
}

/// Driver whose pages always render `html`.
pub struct StaticDriver {
    html: String,
    pub contexts: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl StaticDriver {
    pub fn new(html: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            html: html.into(),
            contexts: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn contexts(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for StaticDriver {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn new_context(
        &self,
        _options: &ContextOptions,
    ) -> Result<Box<dyn BrowserPage>, BrowserError> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticPage {
            html: self.html.clone(),
            url: Mutex::new(String::new()),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct StaticPage {
    html: String,
    url: Mutex<String>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserPage for StaticPage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<Option<u16>, BrowserError> {
        *self.url.lock() = url.to_string();
        Ok(Some(200))
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.html.clone())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.url.lock().clone())
    }

    async fn exists(&self, _selector: &str) -> Result<bool, BrowserError> {
        Ok(false)
    }

    async fn click(&self, _selector: &str) -> Result<bool, BrowserError> {
        Ok(false)
    }

    async fn fill(&self, _selector: &str, _text: &str) -> Result<bool, BrowserError> {
        Ok(false)
    }

    async fn attribute(
        &self,
        _selector: &str,
        _name: &str,
    ) -> Result<Option<String>, BrowserError> {
        Ok(None)
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(serde_json::Value::Null)
    }

    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, BrowserError> {
        Err(BrowserError::Other("no network".into()))
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocking browser returning a canned snapshot.
pub struct CannedBrowser {
    html: String,
    pub calls: AtomicUsize,
}

impl CannedBrowser {
    pub fn new(html: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            html: html.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BlockingBrowser for CannedBrowser {
    fn name(&self) -> &'static str {
        "canned"
    }

    fn fetch(&self, url: &str, _profile: &LaunchProfile) -> Result<BrowserSnapshot, BrowserError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BrowserSnapshot {
            html: self.html.clone(),
            url: url.to_string(),
            status: Some(200),
        })
    }
}

/// Records every dispatched event.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<FetchEvent>>,
}

impl RecordingHandler {
    pub fn attempts_started(&self) -> Vec<(&'static str, u32)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                FetchEvent::AttemptStarted(started) => Some((started.strategy, started.attempt)),
                _ => None,
            })
            .collect()
    }

    pub fn degraded(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, FetchEvent::Degraded(_)))
            .count()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &FetchEvent) {
        self.events.lock().push(event.clone());
    }
}
