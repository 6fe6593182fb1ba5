//! Audio captcha solver backed by a pluggable [`SpeechRecognizer`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{ChallengeSolver, SolverError};
use crate::challenges::core::{ChallengeInput, SolveOutcome};
use crate::external_deps::{NoSpeechRecognizer, SpeechRecognizer};

pub struct AudioCaptchaSolver {
    speech: Arc<dyn SpeechRecognizer>,
}

impl Default for AudioCaptchaSolver {
    fn default() -> Self {
        Self::new(Arc::new(NoSpeechRecognizer))
    }
}

impl AudioCaptchaSolver {
    pub fn new(speech: Arc<dyn SpeechRecognizer>) -> Self {
        Self { speech }
    }

    /// Transcribe a clip into a normalised answer (lower case, single spaces).
    pub async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>, SolverError> {
        let raw = self.speech.transcribe(audio).await?;
        let answer = normalize_transcript(&raw);
        Ok((!answer.is_empty()).then_some(answer))
    }
}

#[async_trait]
impl ChallengeSolver for AudioCaptchaSolver {
    fn name(&self) -> &'static str {
        "audio"
    }

    async fn solve(&self, input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError> {
        let source = input
            .info
            .resource
            .as_deref()
            .ok_or(SolverError::MissingResource("captcha audio source"))?;
        let audio = input.loader.load(source, input.url, input.page).await?;
        Ok(match self.transcribe(&audio).await? {
            Some(answer) => SolveOutcome::Solved { answer },
            None => SolveOutcome::unsolved("empty transcript"),
        })
    }
}

fn normalize_transcript(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
