//! chromiumoxide-backed [`BrowserDriver`].
//!
//! One Chromium process is shared by all fetches; every call to
//! [`BrowserDriver::new_context`] creates a fresh incognito-style browser
//! context so cookies and storage never leak between fetches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetGeolocationOverrideParams, SetLocaleOverrideParams,
    SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{BrowserDriver, BrowserError, BrowserPage, ContextOptions};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-infobars",
];

/// Shared Chromium process handing out isolated contexts.
pub struct ChromiumDriver {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromiumDriver {
    /// Launch Chromium. `headless = false` opens a visible window.
    pub async fn launch(headless: bool) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder().args(LAUNCH_ARGS.iter().copied());
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        log::info!("chromium driver launched (headless={headless})");
        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
            handler,
        })
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let (context_id, page) = {
            let mut browser = self.browser.lock().await;

            let mut context_params = CreateBrowserContextParams::default();
            context_params.proxy_server = options.proxy.clone();
            let context_id = browser
                .create_browser_context(context_params)
                .await
                .map_err(|err| BrowserError::Launch(err.to_string()))?;

            let mut target = CreateTargetParams::new("about:blank");
            target.browser_context_id = Some(context_id.clone());
            let page = browser
                .new_page(target)
                .await
                .map_err(|err| BrowserError::Launch(err.to_string()))?;
            (context_id, page)
        };

        let chromium_page = ChromiumPage {
            browser: self.browser.clone(),
            context_id,
            page,
            read_timeout: read_timeout(options),
        };
        if let Err(err) = chromium_page.apply(options).await {
            if let Err(close_err) = Box::new(chromium_page).close().await {
                log::debug!("closing a half-configured context failed: {close_err}");
            }
            return Err(err);
        }
        Ok(Box::new(chromium_page))
    }
}

struct ChromiumPage {
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
    page: Page,
    read_timeout: Duration,
}

fn read_timeout(options: &ContextOptions) -> Duration {
    if options.read_timeout.is_zero() {
        DEFAULT_READ_TIMEOUT
    } else {
        options.read_timeout
    }
}

impl ChromiumPage {
    async fn apply(&self, options: &ContextOptions) -> Result<(), BrowserError> {
        let page = &self.page;
        if !options.user_agent.is_empty() {
            page.execute(SetUserAgentOverrideParams::new(options.user_agent.clone()))
                .await
                .map_err(other)?;
        }

        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(options.viewport.width),
            i64::from(options.viewport.height),
            1.0,
            false,
        ))
        .await
        .map_err(other)?;

        if !options.timezone.is_empty() {
            page.execute(SetTimezoneOverrideParams::new(options.timezone.clone()))
                .await
                .map_err(other)?;
        }

        if !options.locale.is_empty() {
            let mut locale = SetLocaleOverrideParams::default();
            locale.locale = Some(options.locale.clone());
            page.execute(locale).await.map_err(other)?;
        }

        if let Some(geo) = options.geolocation {
            let mut params = SetGeolocationOverrideParams::default();
            params.latitude = Some(geo.latitude);
            params.longitude = Some(geo.longitude);
            params.accuracy = Some(50.0);
            page.execute(params).await.map_err(other)?;
        }

        if !options.extra_headers.is_empty() {
            let map: serde_json::Map<String, serde_json::Value> = options
                .extra_headers
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                .collect();
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(
                serde_json::Value::Object(map),
            )))
            .await
            .map_err(other)?;
        }

        if let Some(script) = &options.init_script {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                .await
                .map_err(|err| BrowserError::Script(err.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(&self, url: &str, limit: Duration) -> Result<Option<u16>, BrowserError> {
        match timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(None),
            Ok(Err(err)) => Err(BrowserError::Navigation(err.to_string())),
            Err(_) => Err(BrowserError::Timeout(limit)),
        }
    }

    async fn wait_for_network_idle(&self, limit: Duration) -> Result<(), BrowserError> {
        match timeout(limit, self.page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(BrowserError::Navigation(err.to_string())),
            Err(_) => Err(BrowserError::Timeout(limit)),
        }
    }

    async fn content(&self) -> Result<String, BrowserError> {
        match timeout(self.read_timeout, self.page.content()).await {
            Ok(result) => result.map_err(other),
            Err(_) => Err(BrowserError::Timeout(self.read_timeout)),
        }
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.page.url().await.map_err(other)?.unwrap_or_default())
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(false);
        };
        element.click().await.map_err(other)?;
        Ok(true)
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<bool, BrowserError> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(false);
        };
        element.click().await.map_err(other)?;
        element.type_str(text).await.map_err(other)?;
        Ok(true)
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(None);
        };
        element.attribute(name).await.map_err(other)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, BrowserError> {
        let target =
            serde_json::to_string(url).map_err(|err| BrowserError::Script(err.to_string()))?;
        let script = format!(
            "fetch({target}).then(r => r.arrayBuffer()).then(b => Array.from(new Uint8Array(b)))"
        );
        let value = self.evaluate(&script).await?;
        let bytes = value
            .as_array()
            .ok_or_else(|| BrowserError::Script("resource fetch returned no data".into()))?
            .iter()
            .filter_map(|v| v.as_u64().map(|b| b as u8))
            .collect();
        Ok(bytes)
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let ChromiumPage {
            browser,
            context_id,
            page,
            ..
        } = *self;
        let page_result = page.close().await.map_err(other);
        let browser = browser.lock().await;
        browser
            .dispose_browser_context(context_id)
            .await
            .map_err(other)?;
        page_result
    }
}

fn other(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Other(err.to_string())
}
