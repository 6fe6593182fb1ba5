//! Browser automation seams.
//!
//! Two flavours are consumed by the fetch strategies:
//!
//! - [`BrowserDriver`] is async and hands out isolated browsing contexts
//!   ([`BrowserPage`]) that can be navigated, inspected and torn down.
//! - [`BlockingBrowser`] is a synchronous full-browser launch used as the
//!   last resort. Callers must run it on a blocking worker thread.
//!
//! Bindings: `chromium` (chromiumoxide) and `headless-chrome`
//! (headless_chrome) cargo features.

#[cfg(feature = "chromium")]
mod chromium;
#[cfg(feature = "headless-chrome")]
mod headless;

#[cfg(feature = "chromium")]
pub use chromium::ChromiumDriver;
#[cfg(feature = "headless-chrome")]
pub use headless::HeadlessChromeBrowser;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Browser window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Overrides applied to a freshly created isolated browsing context.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub user_agent: String,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
    pub geolocation: Option<Geolocation>,
    pub extra_headers: Vec<(String, String)>,
    pub init_script: Option<String>,
    pub proxy: Option<String>,
    /// Deadline for reading page state. Zero leaves the binding's default.
    pub read_timeout: Duration,
}

/// Launch parameters for the blocking last-resort browser.
#[derive(Debug, Clone, Default)]
pub struct LaunchProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headless: bool,
    pub page_load_timeout: Duration,
    pub settle_delay: Duration,
    pub init_script: Option<String>,
    pub proxy: Option<String>,
}

/// Page state captured by the blocking browser before it shuts down.
#[derive(Debug, Clone)]
pub struct BrowserSnapshot {
    pub html: String,
    pub url: String,
    pub status: Option<u16>,
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("browser operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("browser context closed")]
    Closed,
    #[error("browser driver unavailable: {0}")]
    Unavailable(&'static str),
    #[error("browser error: {0}")]
    Other(String),
}

/// Async driver able to open isolated browsing contexts.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open an isolated context with a single page, applying `options`
    /// before any navigation happens.
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

/// A single page living in its own isolated context.
///
/// Element helpers return `Ok(false)`/`Ok(None)` when the selector matches
/// nothing; `Err` is reserved for driver failures.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigate and wait for DOM content. Returns the main document status
    /// when the driver exposes it.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Option<u16>, BrowserError>;

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn content(&self) -> Result<String, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError>;

    async fn click(&self, selector: &str) -> Result<bool, BrowserError>;

    async fn fill(&self, selector: &str, text: &str) -> Result<bool, BrowserError>;

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// Download a resource using the page's own network context (cookies,
    /// proxy and headers included).
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, BrowserError>;

    /// Close the page and dispose of its context.
    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

/// Synchronous full-browser launch. Implementations block the calling thread.
pub trait BlockingBrowser: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch(&self, url: &str, profile: &LaunchProfile) -> Result<BrowserSnapshot, BrowserError>;
}
