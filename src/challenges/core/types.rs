//! Data shared between the detector, the resolver and the individual solvers.

use std::fmt;

use crate::external_deps::BrowserPage;

use super::resource::ResourceLoader;

/// Challenge families the detector can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    RecaptchaV2,
    /// Invisible, score-based reCAPTCHA (`render=` in the loader URL).
    RecaptchaV3,
    Hcaptcha,
    /// Managed "checking your browser" verification wall.
    Interstitial,
    ImageCaptcha,
    AudioCaptcha,
}

impl ChallengeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChallengeKind::RecaptchaV2 => "recaptcha_v2",
            ChallengeKind::RecaptchaV3 => "recaptcha_v3",
            ChallengeKind::Hcaptcha => "hcaptcha",
            ChallengeKind::Interstitial => "interstitial",
            ChallengeKind::ImageCaptcha => "image",
            ChallengeKind::AudioCaptcha => "audio",
        }
    }

    pub fn is_recaptcha(&self) -> bool {
        matches!(self, ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV3)
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a detection pass over one body. Lives for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeInfo {
    pub kind: ChallengeKind,
    /// Widget site key (`data-sitekey`) when the page exposes one.
    pub site_key: Option<String>,
    /// Image or audio source for media captchas; may be relative or a `data:` URI.
    pub resource: Option<String>,
    pub matched_indicators: Vec<String>,
}

impl ChallengeInfo {
    pub fn new(kind: ChallengeKind) -> Self {
        Self {
            kind,
            site_key: None,
            resource: None,
            matched_indicators: Vec::new(),
        }
    }
}

/// What a solver managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// A textual answer or response token was obtained.
    Solved { answer: String },
    /// The challenge went away (interstitial passed) without an answer.
    Cleared,
    Unsolved { reason: String },
}

impl SolveOutcome {
    pub fn unsolved(reason: impl Into<String>) -> Self {
        SolveOutcome::Unsolved {
            reason: reason.into(),
        }
    }

    pub fn is_solved(&self) -> bool {
        !matches!(self, SolveOutcome::Unsolved { .. })
    }

    pub fn answer(&self) -> Option<&str> {
        match self {
            SolveOutcome::Solved { answer } => Some(answer),
            _ => None,
        }
    }
}

/// Everything a solver may look at for one challenge.
pub struct ChallengeInput<'a> {
    pub info: &'a ChallengeInfo,
    /// URL the challenge was served from; relative resources resolve against it.
    pub url: &'a str,
    pub body: &'a str,
    /// Live page, when the challenge came from a browser stage.
    pub page: Option<&'a dyn BrowserPage>,
    pub loader: &'a ResourceLoader,
}

impl fmt::Debug for ChallengeInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeInput")
            .field("info", &self.info)
            .field("url", &self.url)
            .field("body_len", &self.body.len())
            .field("has_page", &self.page.is_some())
            .finish()
    }
}
