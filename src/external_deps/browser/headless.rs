//! headless_chrome-backed [`BlockingBrowser`].
//!
//! Launches a dedicated Chrome process per fetch. Every call blocks, so the
//! engine only invokes it from `spawn_blocking`.

use std::ffi::OsStr;
use std::time::Duration;

use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};

use super::{BlockingBrowser, BrowserError, BrowserSnapshot, LaunchProfile};

const LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--disable-infobars",
];

#[derive(Debug, Clone, Default)]
pub struct HeadlessChromeBrowser;

impl HeadlessChromeBrowser {
    pub fn new() -> Self {
        Self
    }
}

impl BlockingBrowser for HeadlessChromeBrowser {
    fn name(&self) -> &'static str {
        "headless_chrome"
    }

    fn fetch(&self, url: &str, profile: &LaunchProfile) -> Result<BrowserSnapshot, BrowserError> {
        let user_agent_arg = format!("--user-agent={}", profile.user_agent);
        let mut args: Vec<&OsStr> = LAUNCH_ARGS.iter().map(OsStr::new).collect();
        if !profile.user_agent.is_empty() {
            args.push(OsStr::new(&user_agent_arg));
        }

        let options = LaunchOptions::default_builder()
            .headless(profile.headless)
            .sandbox(false)
            .window_size(Some((profile.viewport.width, profile.viewport.height)))
            .proxy_server(profile.proxy.as_deref())
            .idle_browser_timeout(profile.page_load_timeout + Duration::from_secs(30))
            .args(args)
            .build()
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let browser = Browser::new(options).map_err(|err| BrowserError::Launch(err.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        tab.set_default_timeout(profile.page_load_timeout);

        if !profile.user_agent.is_empty() {
            tab.set_user_agent(
                &profile.user_agent,
                Some(profile.accept_language.as_str()).filter(|v| !v.is_empty()),
                Some(profile.platform.as_str()).filter(|v| !v.is_empty()),
            )
            .map_err(|err| BrowserError::Other(err.to_string()))?;
        }
        tab.enable_stealth_mode()
            .map_err(|err| BrowserError::Other(err.to_string()))?;

        if let Some(script) = &profile.init_script {
            tab.call_method(new_document_script(script))
                .map_err(|err| BrowserError::Script(err.to_string()))?;
        }

        tab.navigate_to(url)
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;
        tab.wait_until_navigated()
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        std::thread::sleep(profile.settle_delay);

        let html = tab
            .get_content()
            .map_err(|err| BrowserError::Other(err.to_string()))?;
        Ok(BrowserSnapshot {
            html,
            url: tab.get_url(),
            status: None,
        })
    }
}

/// Runs `source` in every document before the page's own scripts.
fn new_document_script(source: &str) -> Page::AddScriptToEvaluateOnNewDocument {
    Page::AddScriptToEvaluateOnNewDocument {
        source: source.to_string(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    }
}
