//! Browser identity generation.
//!
//! Produces browser/OS-consistent fingerprints, the request headers that go
//! with them, and the init script that hides automation markers inside a
//! real browser. A [`FingerprintRotator`] keeps one identity alive for a
//! bounded number of requests or amount of time.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::external_deps::browser::Viewport;

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

const SCREEN_RESOLUTIONS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
    (2560, 1440),
    (1600, 900),
    (1680, 1050),
    (1280, 1024),
    (1920, 1200),
    (2560, 1080),
    (3440, 1440),
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Paris",
    "Europe/Berlin",
    "Asia/Tokyo",
    "Asia/Singapore",
];

/// Accept-Language values, rotated by attempt on retries.
pub const LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en;q=0.9",
    "en-US,en;q=0.8",
    "en-AU,en;q=0.9,en-US;q=0.8",
];

const CHROME_VERSIONS: &[&str] = &["118", "119", "120", "121", "122"];
const DEVICE_MEMORY: &[u8] = &[4, 8, 16, 32];
const HARDWARE_CONCURRENCY: &[u8] = &[4, 8, 12, 16];
const CACHE_CONTROL: &[&str] = &["max-age=0", "no-cache", "no-store"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

impl BrowserType {
    pub fn is_chromium(&self) -> bool {
        matches!(self, BrowserType::Chrome | BrowserType::Edge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Os {
    Windows,
    Mac,
    Linux,
}

impl Os {
    fn platform(&self) -> &'static str {
        match self {
            Os::Windows => "Win32",
            Os::Mac => "MacIntel",
            Os::Linux => "Linux x86_64",
        }
    }

    fn client_hint(&self) -> &'static str {
        match self {
            Os::Windows => "\"Windows\"",
            Os::Mac => "\"macOS\"",
            Os::Linux => "\"Linux\"",
        }
    }

    fn browsers(&self) -> &'static [BrowserType] {
        match self {
            Os::Windows => &[BrowserType::Chrome, BrowserType::Edge, BrowserType::Firefox],
            Os::Mac => &[BrowserType::Chrome, BrowserType::Safari, BrowserType::Firefox],
            Os::Linux => &[BrowserType::Chrome, BrowserType::Firefox],
        }
    }
}

fn user_agent_for(os: Os, browser: BrowserType, version: &str) -> String {
    let chrome_base = match os {
        Os::Windows => "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)",
        Os::Mac => "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko)",
        Os::Linux => "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko)",
    };
    match browser {
        BrowserType::Chrome => format!("{chrome_base} Chrome/{version}.0.0.0 Safari/537.36"),
        BrowserType::Edge => {
            format!("{chrome_base} Chrome/{version}.0.0.0 Safari/537.36 Edg/{version}.0.0.0")
        }
        BrowserType::Firefox => match os {
            Os::Windows => "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0".into(),
            Os::Mac => "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:125.0) Gecko/20100101 Firefox/125.0".into(),
            Os::Linux => "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0".into(),
        },
        BrowserType::Safari => "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15".into(),
    }
}

/// A coherent client identity.
#[derive(Debug, Clone)]
pub struct BrowserFingerprint {
    pub browser: BrowserType,
    pub user_agent: String,
    pub platform: String,
    pub platform_hint: String,
    pub chrome_version: Option<String>,
    pub sec_ch_ua: Option<String>,
    pub viewport: Viewport,
    pub color_depth: u8,
    pub timezone: String,
    pub accept_language: String,
    pub device_memory: u8,
    pub hardware_concurrency: u8,
    pub created_at: DateTime<Utc>,
}

impl BrowserFingerprint {
    /// Primary locale derived from `Accept-Language` (`en-US,en;q=0.9` -> `en-US`).
    pub fn locale(&self) -> String {
        primary_language(&self.accept_language)
    }
}

fn primary_language(accept_language: &str) -> String {
    accept_language
        .split(',')
        .next()
        .and_then(|tag| tag.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .unwrap_or("en-US")
        .to_string()
}

/// Generates randomized but internally consistent fingerprints.
#[derive(Debug, Clone)]
pub struct FingerprintGenerator {
    allowed: Vec<BrowserType>,
}

impl FingerprintGenerator {
    pub fn new() -> Self {
        Self {
            allowed: vec![
                BrowserType::Chrome,
                BrowserType::Edge,
                BrowserType::Firefox,
                BrowserType::Safari,
            ],
        }
    }

    /// Restrict generation to the given browsers. An empty list keeps the
    /// current selection.
    pub fn with_browsers(mut self, browsers: Vec<BrowserType>) -> Self {
        if !browsers.is_empty() {
            self.allowed = browsers;
        }
        self
    }

    pub fn generate(&self) -> BrowserFingerprint {
        let mut rng = rand::thread_rng();

        let candidates: Vec<(Os, BrowserType)> = [Os::Windows, Os::Mac, Os::Linux]
            .into_iter()
            .flat_map(|os| os.browsers().iter().map(move |browser| (os, *browser)))
            .filter(|(_, browser)| self.allowed.contains(browser))
            .collect();
        let (os, browser) = candidates
            .choose(&mut rng)
            .copied()
            .unwrap_or((Os::Windows, BrowserType::Chrome));

        let version = CHROME_VERSIONS.choose(&mut rng).copied().unwrap_or("120");
        let (width, height) = SCREEN_RESOLUTIONS
            .choose(&mut rng)
            .copied()
            .unwrap_or((1920, 1080));

        let (chrome_version, sec_ch_ua) = if browser.is_chromium() {
            let brand = if browser == BrowserType::Edge {
                "Microsoft Edge"
            } else {
                "Google Chrome"
            };
            (
                Some(version.to_string()),
                Some(format!(
                    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{version}\", \"{brand}\";v=\"{version}\""
                )),
            )
        } else {
            (None, None)
        };

        BrowserFingerprint {
            browser,
            user_agent: user_agent_for(os, browser, version),
            platform: os.platform().to_string(),
            platform_hint: os.client_hint().to_string(),
            chrome_version,
            sec_ch_ua,
            viewport: Viewport { width, height },
            color_depth: if rng.gen_bool(0.5) { 24 } else { 32 },
            timezone: TIMEZONES.choose(&mut rng).copied().unwrap_or("UTC").to_string(),
            accept_language: LANGUAGES
                .choose(&mut rng)
                .copied()
                .unwrap_or(LANGUAGES[0])
                .to_string(),
            device_memory: DEVICE_MEMORY.choose(&mut rng).copied().unwrap_or(8),
            hardware_concurrency: HARDWARE_CONCURRENCY.choose(&mut rng).copied().unwrap_or(8),
            created_at: Utc::now(),
        }
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural knobs applied on top of a fingerprint when building headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderVariation {
    /// Selects the `Cache-Control` value.
    pub index: usize,
    /// Adds `Pragma: no-cache` and a search-engine referer where it fits.
    pub stealth: bool,
    /// Overrides `Accept-Language` with `LANGUAGES[n % len]`.
    pub language_rotation: Option<usize>,
}

impl HeaderVariation {
    /// Variation used for retry `attempt` (1-based).
    pub fn for_retry(attempt: u32) -> Self {
        Self {
            index: attempt as usize,
            stealth: true,
            language_rotation: Some(attempt as usize),
        }
    }
}

/// Full navigation header set for `fingerprint`. `custom` headers are merged
/// last and win; invalid names or values are skipped.
pub fn build_headers(
    fingerprint: &BrowserFingerprint,
    url: &str,
    variation: HeaderVariation,
    custom: &[(String, String)],
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let accept_language = variation
        .language_rotation
        .map(|n| LANGUAGES[n % LANGUAGES.len()])
        .unwrap_or(fingerprint.accept_language.as_str());

    insert(&mut headers, "user-agent", &fingerprint.user_agent);
    insert(&mut headers, "accept", ACCEPT_HTML);
    insert(&mut headers, "accept-language", accept_language);
    insert(&mut headers, "accept-encoding", "gzip, deflate, br");
    insert(&mut headers, "dnt", "1");
    insert(&mut headers, "upgrade-insecure-requests", "1");

    if let Some(sec_ch_ua) = &fingerprint.sec_ch_ua {
        insert(&mut headers, "sec-ch-ua", sec_ch_ua);
        insert(&mut headers, "sec-ch-ua-mobile", "?0");
        insert(&mut headers, "sec-ch-ua-platform", &fingerprint.platform_hint);
        insert(&mut headers, "sec-fetch-dest", "document");
        insert(&mut headers, "sec-fetch-mode", "navigate");
        insert(&mut headers, "sec-fetch-site", "none");
        insert(&mut headers, "sec-fetch-user", "?1");
    }

    insert(
        &mut headers,
        "cache-control",
        CACHE_CONTROL[variation.index % CACHE_CONTROL.len()],
    );

    if variation.stealth {
        insert(&mut headers, "pragma", "no-cache");
        if let Some(referer) = search_referer(url) {
            insert(&mut headers, "referer", referer);
        }
    }

    for (name, value) in custom {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => log::debug!("skipping invalid header {name}"),
        }
    }

    headers
}

/// Extra headers a browser context sends with every navigation.
pub fn browser_context_headers(fingerprint: &BrowserFingerprint) -> Vec<(String, String)> {
    vec![
        ("Accept-Language".into(), fingerprint.accept_language.clone()),
        ("Accept-Encoding".into(), "gzip, deflate, br".into()),
        ("DNT".into(), "1".into()),
        ("Sec-Fetch-Dest".into(), "document".into()),
        ("Sec-Fetch-Mode".into(), "navigate".into()),
        ("Sec-Fetch-Site".into(), "none".into()),
        ("Sec-Fetch-User".into(), "?1".into()),
    ]
}

fn search_referer(url: &str) -> Option<&'static str> {
    let lower = url.to_ascii_lowercase();
    if lower.contains("google") {
        Some("https://www.google.com/")
    } else if lower.contains("bing") {
        Some("https://www.bing.com/")
    } else {
        None
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Init script hiding automation markers and aligning navigator properties
/// with `fingerprint`.
pub fn stealth_script(fingerprint: &BrowserFingerprint) -> String {
    let languages: Vec<String> = fingerprint
        .accept_language
        .split(',')
        .filter_map(|tag| tag.split(';').next())
        .map(|tag| format!("'{}'", tag.trim()))
        .collect();

    format!(
        r#"
Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
window.chrome = {{ runtime: {{}}, loadTimes: function() {{}}, csi: function() {{}}, app: {{}} }};
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
        ? Promise.resolve({{ state: Notification.permission }})
        : originalQuery(parameters)
);
Object.defineProperty(navigator, 'plugins', {{ get: () => [1, 2, 3, 4, 5] }});
Object.defineProperty(navigator, 'languages', {{ get: () => [{languages}] }});
Object.defineProperty(navigator, 'platform', {{ get: () => '{platform}' }});
Object.defineProperty(navigator, 'deviceMemory', {{ get: () => {memory} }});
Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores} }});
Object.defineProperty(screen, 'colorDepth', {{ get: () => {depth} }});
"#,
        languages = languages.join(", "),
        platform = fingerprint.platform,
        memory = fingerprint.device_memory,
        cores = fingerprint.hardware_concurrency,
        depth = fingerprint.color_depth,
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub browsers: Vec<BrowserType>,
    pub rotate_after_requests: u32,
    pub rotate_after_secs: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            browsers: Vec::new(),
            rotate_after_requests: 50,
            rotate_after_secs: 300,
        }
    }
}

struct RotationState {
    current: BrowserFingerprint,
    served: u32,
    since: Instant,
}

/// Keeps a current identity and swaps it every N requests or T elapsed.
pub struct FingerprintRotator {
    generator: FingerprintGenerator,
    max_requests: u32,
    max_age: Duration,
    state: Mutex<RotationState>,
}

impl FingerprintRotator {
    pub fn new(generator: FingerprintGenerator, config: &FingerprintConfig) -> Self {
        let current = generator.generate();
        Self {
            generator,
            max_requests: config.rotate_after_requests.max(1),
            max_age: Duration::from_secs(config.rotate_after_secs),
            state: Mutex::new(RotationState {
                current,
                served: 0,
                since: Instant::now(),
            }),
        }
    }

    /// Identity for the next request, rotating first when due.
    pub fn current(&self) -> BrowserFingerprint {
        let mut state = self.state.lock();
        state.served += 1;
        if state.served >= self.max_requests || state.since.elapsed() > self.max_age {
            state.current = self.generator.generate();
            state.served = 0;
            state.since = Instant::now();
            log::debug!("rotated browser fingerprint");
        }
        state.current.clone()
    }

    /// A fresh identity that does not replace the current one.
    pub fn fresh(&self) -> BrowserFingerprint {
        self.generator.generate()
    }
}

impl std::fmt::Debug for FingerprintRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintRotator")
            .field("max_requests", &self.max_requests)
            .field("max_age", &self.max_age)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_fingerprints_carry_client_hints() {
        let generator = FingerprintGenerator::new().with_browsers(vec![BrowserType::Chrome]);
        for _ in 0..20 {
            let fp = generator.generate();
            let version = fp.chrome_version.clone().unwrap();
            assert!(fp.user_agent.contains(&format!("Chrome/{version}")));
            assert!(fp.sec_ch_ua.as_deref().unwrap().contains(&version));
            match fp.platform.as_str() {
                "Win32" => assert!(fp.user_agent.contains("Windows")),
                "MacIntel" => assert!(fp.user_agent.contains("Macintosh")),
                "Linux x86_64" => assert!(fp.user_agent.contains("Linux")),
                other => panic!("unexpected platform {other}"),
            }
        }
    }

    #[test]
    fn safari_only_runs_on_mac() {
        let generator = FingerprintGenerator::new().with_browsers(vec![BrowserType::Safari]);
        let fp = generator.generate();
        assert_eq!(fp.platform, "MacIntel");
        assert!(fp.sec_ch_ua.is_none());
    }

    #[test]
    fn headers_follow_variation() {
        let fp = FingerprintGenerator::new()
            .with_browsers(vec![BrowserType::Chrome])
            .generate();
        let plain = build_headers(&fp, "https://example.com", HeaderVariation::default(), &[]);
        assert_eq!(plain["cache-control"], "max-age=0");
        assert!(plain.get("pragma").is_none());
        assert!(plain.get("sec-ch-ua").is_some());

        let retry = build_headers(
            &fp,
            "https://www.google.com/search?q=rust",
            HeaderVariation::for_retry(1),
            &[("X-Trace".into(), "abc".into()), ("bad header".into(), "x".into())],
        );
        assert_eq!(retry["cache-control"], "no-cache");
        assert_eq!(retry["pragma"], "no-cache");
        assert_eq!(retry["referer"], "https://www.google.com/");
        assert_eq!(retry["accept-language"], LANGUAGES[1]);
        assert_eq!(retry["x-trace"], "abc");
    }

    #[test]
    fn stealth_script_reflects_fingerprint() {
        let fp = FingerprintGenerator::new().generate();
        let script = stealth_script(&fp);
        assert!(script.contains("'webdriver'"));
        assert!(script.contains(&format!("'{}'", fp.platform)));
        assert!(script.contains(&format!("=> {}", fp.device_memory)));
    }

    #[test]
    fn locale_is_primary_tag() {
        assert_eq!(primary_language("en-AU,en;q=0.9,en-US;q=0.8"), "en-AU");
        assert_eq!(primary_language("en;q=0.9"), "en");
    }

    #[tokio::test(start_paused = true)]
    async fn rotator_swaps_after_request_budget_and_age() {
        let config = FingerprintConfig {
            rotate_after_requests: 3,
            rotate_after_secs: 300,
            ..Default::default()
        };
        let rotator = FingerprintRotator::new(FingerprintGenerator::new(), &config);
        let first = rotator.current();
        let second = rotator.current();
        assert_eq!(first.created_at, second.created_at);
        let third = rotator.current();
        assert!(third.created_at >= first.created_at);
        assert_eq!(rotator.state.lock().served, 0);

        rotator.current();
        tokio::time::advance(Duration::from_secs(301)).await;
        rotator.current();
        assert_eq!(rotator.state.lock().served, 0);
    }
}
