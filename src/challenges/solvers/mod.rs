//! Challenge solver registry.
//!
//! Each submodule handles one challenge family. Solvers report failures as
//! [`SolverError`]; the resolver folds those into
//! [`SolveOutcome::Unsolved`](crate::challenges::core::SolveOutcome) so
//! nothing escapes to the fetch cascade.

pub mod audio;
pub mod image;
pub mod interstitial;
pub mod recaptcha;
pub mod unsupported;

pub use audio::AudioCaptchaSolver;
pub use image::ImageCaptchaSolver;
pub use interstitial::InterstitialSolver;
pub use recaptcha::RecaptchaSolver;
pub use unsupported::UnsupportedSolver;

use async_trait::async_trait;
use thiserror::Error;

use crate::challenges::core::{ChallengeInput, SolveOutcome};
use crate::external_deps::{BrowserError, OcrError, SpeechError};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("a live browser page is required")]
    PageRequired,
    #[error("missing {0}")]
    MissingResource(&'static str),
    #[error("captcha media request returned status {0}")]
    ResourceStatus(u16),
    #[error("malformed data uri")]
    InvalidDataUri,
    #[error("invalid resource url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(#[from] ::image::ImageError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Speech(#[from] SpeechError),
    #[error("solver worker failed: {0}")]
    Worker(String),
}

/// Common solver interface.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError>;
}

/// Keep only ASCII letters and digits.
pub fn clean_solution(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}
