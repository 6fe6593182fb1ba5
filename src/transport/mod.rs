//! HTTP transport abstraction consumed by the transport strategies.
//!
//! Requests carry their own proxy and timeout so one transport instance can
//! serve every concurrent fetch. The reqwest-backed implementation keeps one
//! pooled client per proxy endpoint.

mod reqwest_client;

pub use reqwest_client::{ReqwestTransport, TransportConfig};

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

/// Payload sent with a transport request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Raw(Bytes),
}

/// Single timed request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            proxy: None,
            timeout,
        }
    }
}

/// Response as seen after redirects.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy rejected: {0}")]
    Proxy(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Request(String),
}

/// Contract for the underlying HTTP client.
///
/// Implementations should keep cookies between calls that share a proxy so
/// the session behaves like one browser.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
