//! Challenge detection module.
//!
//! Detection is a cheap synchronous text scan over a response body or a
//! browser page snapshot. Patterns are evaluated in a fixed order and the
//! first family that matches wins, so a page embedding both a reCAPTCHA widget
//! and a generic captcha image is reported as reCAPTCHA.

use std::collections::VecDeque;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use scraper::{Html, Selector};

use crate::challenges::core::{ChallengeInfo, ChallengeKind};

/// Lower-cased markers of a managed verification wall.
pub const INTERSTITIAL_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "checking your browser",
    "cf_chl_",
    "just a moment",
    "challenge-platform",
    "turnstile",
];

/// Signature list for one challenge family.
#[derive(Debug, Clone)]
struct ChallengePattern {
    kind: ChallengeKind,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(kind: ChallengeKind, raw_patterns: &[&str]) -> Self {
        Self {
            kind,
            patterns: raw_patterns.iter().map(|p| build_regex(p)).collect(),
        }
    }

    fn matches(&self, body: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|regex| regex.is_match(body))
            .map(|regex| regex.as_str().to_string())
            .collect()
    }
}

/// Known signatures in evaluation order.
static KNOWN_PATTERNS: Lazy<Vec<ChallengePattern>> = Lazy::new(|| {
    vec![
        ChallengePattern::new(ChallengeKind::RecaptchaV2, &[r"g-recaptcha", r"recaptcha"]),
        ChallengePattern::new(ChallengeKind::Hcaptcha, &[r"h-captcha", r"hcaptcha"]),
        ChallengePattern::new(
            ChallengeKind::Interstitial,
            &[
                r"cf-browser-verification",
                r"checking your browser",
                r"cf_chl_",
                r"just a moment",
                r"challenge-platform",
                r"turnstile",
            ],
        ),
        ChallengePattern::new(
            ChallengeKind::ImageCaptcha,
            &[r"captcha[^>\n]{0,200}?\.(?:jpe?g|png|gif)\b"],
        ),
        ChallengePattern::new(
            ChallengeKind::AudioCaptcha,
            &[r"captcha[^>\n]{0,200}?\.(?:mp3|wav|ogg)\b"],
        ),
    ]
});

static RECAPTCHA_RENDER: Lazy<Regex> = Lazy::new(|| build_regex(r"recaptcha/[^\s]*render="));
static SITE_KEY: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-sitekey=["']([^"']+)["']"#));
static IMAGE_SOURCE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"["']([^"'\s]*captcha[^"'\s]*\.(?:jpe?g|png|gif)[^"'\s]*)["']"#)
});
static AUDIO_SOURCE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"["']([^"'\s]*captcha[^"'\s]*\.(?:mp3|wav|ogg)[^"'\s]*)["']"#)
});
static IMG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img[src]").expect("static selector"));

/// Public view of a recorded detection.
#[derive(Debug, Clone)]
pub struct DetectionLogEntry {
    pub timestamp: SystemTime,
    pub kind: ChallengeKind,
    pub url: String,
}

/// Pattern-based challenge detector with a bounded detection history.
///
/// The detector is shared by every in-flight fetch, so the history sits
/// behind a short-lived lock and `detect` only needs `&self`.
#[derive(Debug)]
pub struct ChallengeDetector {
    known_patterns: &'static [ChallengePattern],
    history: Mutex<VecDeque<DetectionLogEntry>>,
    max_history: usize,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeDetector {
    pub fn new() -> Self {
        Self {
            known_patterns: KNOWN_PATTERNS.as_slice(),
            history: Mutex::new(VecDeque::with_capacity(128)),
            max_history: 1000,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Classify `body`. Returns `None` when no known signature matches.
    pub fn detect(&self, url: &str, body: &str) -> Option<ChallengeInfo> {
        let (pattern, matched) = self.known_patterns.iter().find_map(|pattern| {
            let matched = pattern.matches(body);
            (!matched.is_empty()).then_some((pattern, matched))
        })?;

        let kind = match pattern.kind {
            ChallengeKind::RecaptchaV2 if RECAPTCHA_RENDER.is_match(body) => {
                ChallengeKind::RecaptchaV3
            }
            kind => kind,
        };

        let mut info = ChallengeInfo::new(kind);
        info.matched_indicators = matched;
        info.site_key = extract_site_key(body);
        info.resource = match kind {
            ChallengeKind::ImageCaptcha => extract_image_source(body),
            ChallengeKind::AudioCaptcha => capture(&AUDIO_SOURCE, body),
            _ => None,
        };

        self.record(kind, url);
        Some(info)
    }

    fn record(&self, kind: ChallengeKind, url: &str) {
        let mut history = self.history.lock();
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(DetectionLogEntry {
            timestamp: SystemTime::now(),
            kind,
            url: url.to_string(),
        });
    }

    /// Snapshot of recorded detections (oldest -> newest).
    pub fn detection_history(&self) -> Vec<DetectionLogEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

/// True while `content` still shows a managed verification wall.
pub fn is_interstitial(content: &str) -> bool {
    let lowered = content.to_lowercase();
    INTERSTITIAL_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub fn extract_site_key(body: &str) -> Option<String> {
    capture(&SITE_KEY, body)
}

/// First `<img>` whose source or identifying attributes mention a captcha,
/// falling back to any quoted captcha image path in the markup.
pub fn extract_image_source(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let from_dom = document.select(&IMG_SELECTOR).find_map(|img| {
        let element = img.value();
        let mentions_captcha = ["src", "id", "alt", "class"].iter().any(|attr| {
            element
                .attr(attr)
                .is_some_and(|value| value.to_lowercase().contains("captcha"))
        });
        if mentions_captcha {
            element.attr("src").map(str::to_string)
        } else {
            None
        }
    });
    from_dom.or_else(|| {
        capture(&IMAGE_SOURCE, body).map(|src| html_escape::decode_html_entities(&src).into_owned())
    })
}

fn capture(regex: &Regex, body: &str) -> Option<String> {
    regex
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge detection regex `{}`: {}", pattern, err))
}
