//! Speech-to-text seam used by audio captcha challenges.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("speech recogniser failed: {0}")]
    Recognition(String),
    #[error("speech recogniser {0} not implemented")]
    NotImplemented(&'static str),
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError>;
}

/// Placeholder recogniser: audio challenges stay unsolved until a real
/// implementation is configured.
#[derive(Debug, Clone, Default)]
pub struct NoSpeechRecognizer;

#[async_trait]
impl SpeechRecognizer for NoSpeechRecognizer {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<String, SpeechError> {
        Err(SpeechError::NotImplemented(self.name()))
    }
}
