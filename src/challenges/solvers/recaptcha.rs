//! reCAPTCHA solver driving the audio sub-flow of a live page.
//!
//! Every missing control short-circuits to `Unsolved`; only driver or
//! recogniser failures come back as errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use super::{AudioCaptchaSolver, ChallengeSolver, SolverError};
use crate::challenges::core::{ChallengeInput, ChallengeKind, SolveOutcome};
use crate::external_deps::{BrowserPage, SpeechRecognizer};

const CHECKBOX_SELECTORS: &[&str] = &[".recaptcha-checkbox-border", "#recaptcha-anchor"];
const AUDIO_BUTTON: &str = "#recaptcha-audio-button";
const AUDIO_SOURCE: &str = "#audio-source";
const AUDIO_RESPONSE: &str = "#audio-response";
const VERIFY_BUTTON: &str = "#recaptcha-verify-button";
const TOKEN_SCRIPT: &str = r#"(() => {
    const field = document.querySelector('[name="g-recaptcha-response"]');
    return field ? field.value : "";
})()"#;

pub struct RecaptchaSolver {
    audio: AudioCaptchaSolver,
    settle: Duration,
}

impl RecaptchaSolver {
    pub fn new(speech: Arc<dyn SpeechRecognizer>, settle: Duration) -> Self {
        Self {
            audio: AudioCaptchaSolver::new(speech),
            settle,
        }
    }

    async fn response_token(page: &dyn BrowserPage) -> Result<Option<String>, SolverError> {
        let value = page.evaluate(TOKEN_SCRIPT).await?;
        Ok(value
            .as_str()
            .filter(|token| !token.is_empty())
            .map(str::to_string))
    }

    async fn click_checkbox(page: &dyn BrowserPage) -> Result<bool, SolverError> {
        for selector in CHECKBOX_SELECTORS {
            if page.click(selector).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl ChallengeSolver for RecaptchaSolver {
    fn name(&self) -> &'static str {
        "recaptcha"
    }

    async fn solve(&self, input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError> {
        let page = input.page.ok_or(SolverError::PageRequired)?;

        if let Some(token) = Self::response_token(page).await? {
            return Ok(SolveOutcome::Solved { answer: token });
        }
        if input.info.kind == ChallengeKind::RecaptchaV3 {
            return Ok(SolveOutcome::unsolved("invisible recaptcha has no interactive flow"));
        }

        if !Self::click_checkbox(page).await? {
            return Ok(SolveOutcome::unsolved("recaptcha checkbox not found"));
        }
        tokio::time::sleep(self.settle).await;
        if let Some(token) = Self::response_token(page).await? {
            info!("recaptcha passed on checkbox click");
            return Ok(SolveOutcome::Solved { answer: token });
        }

        if !page.click(AUDIO_BUTTON).await? {
            return Ok(SolveOutcome::unsolved("audio challenge control not found"));
        }
        tokio::time::sleep(self.settle).await;

        let Some(source) = page.attribute(AUDIO_SOURCE, "src").await? else {
            return Ok(SolveOutcome::unsolved("audio challenge source not found"));
        };
        let clip = page.fetch_bytes(&source).await?;
        let Some(answer) = self.audio.transcribe(&clip).await? else {
            return Ok(SolveOutcome::unsolved("empty audio transcript"));
        };
        debug!("submitting recaptcha audio answer ({} chars)", answer.len());

        if !page.fill(AUDIO_RESPONSE, &answer).await? {
            return Ok(SolveOutcome::unsolved("audio response field not found"));
        }
        if !page.click(VERIFY_BUTTON).await? {
            return Ok(SolveOutcome::unsolved("verify button not found"));
        }
        tokio::time::sleep(self.settle).await;

        Ok(match Self::response_token(page).await? {
            Some(token) => SolveOutcome::Solved { answer: token },
            None => SolveOutcome::unsolved("verification did not yield a token"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::{ChallengeInfo, ResourceLoader};
    use crate::challenges::solvers::test_support::ScriptedPage;
    use crate::external_deps::{NoSpeechRecognizer, SpeechError};
    use serde_json::json;

    struct FixedSpeech;

    #[async_trait]
    impl SpeechRecognizer for FixedSpeech {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn transcribe(&self, _audio: &[u8]) -> Result<String, SpeechError> {
            Ok("Seven Three".into())
        }
    }

    async fn run(
        solver: &RecaptchaSolver,
        kind: ChallengeKind,
        page: Option<&dyn BrowserPage>,
    ) -> Result<SolveOutcome, SolverError> {
        let info = ChallengeInfo::new(kind);
        let loader = ResourceLoader::new(Duration::from_secs(1));
        let input = ChallengeInput {
            info: &info,
            url: "https://example.com/",
            body: "<div class=\"g-recaptcha\"></div>",
            page,
            loader: &loader,
        };
        solver.solve(&input).await
    }

    fn solver(speech: Arc<dyn SpeechRecognizer>) -> RecaptchaSolver {
        RecaptchaSolver::new(speech, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn requires_live_page() {
        let err = run(&solver(Arc::new(NoSpeechRecognizer)), ChallengeKind::RecaptchaV2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::PageRequired));
    }

    #[tokio::test]
    async fn existing_token_is_returned() {
        let page = ScriptedPage::default().evaluations(&[json!("tok-123")]);
        let solver = solver(Arc::new(NoSpeechRecognizer));
        let outcome = run(&solver, ChallengeKind::RecaptchaV2, Some(&page))
            .await
            .unwrap();
        assert_eq!(outcome.answer(), Some("tok-123"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_checkbox_short_circuits() {
        let page = ScriptedPage::default();
        let outcome = run(&solver(Arc::new(FixedSpeech)), ChallengeKind::RecaptchaV2, Some(&page))
            .await
            .unwrap();
        assert_eq!(outcome, SolveOutcome::unsolved("recaptcha checkbox not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_audio_button_short_circuits() {
        let page = ScriptedPage::default().present("#recaptcha-anchor");
        let outcome = run(&solver(Arc::new(FixedSpeech)), ChallengeKind::RecaptchaV2, Some(&page))
            .await
            .unwrap();
        assert_eq!(outcome, SolveOutcome::unsolved("audio challenge control not found"));
        assert_eq!(page.clicks.lock().as_slice(), ["#recaptcha-anchor"]);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_flow_submits_transcript() {
        let page = ScriptedPage::default()
            .present(".recaptcha-checkbox-border")
            .present(AUDIO_BUTTON)
            .present(AUDIO_RESPONSE)
            .present(VERIFY_BUTTON)
            .attribute(
                AUDIO_SOURCE,
                "src",
                "https://www.google.com/recaptcha/api2/payload/audio.mp3",
            )
            .evaluations(&[json!(""), json!(""), json!("solved-token")]);

        let outcome = run(&solver(Arc::new(FixedSpeech)), ChallengeKind::RecaptchaV2, Some(&page))
            .await
            .unwrap();

        assert_eq!(outcome.answer(), Some("solved-token"));
        assert_eq!(
            page.fills.lock().as_slice(),
            [(AUDIO_RESPONSE.to_string(), "seven three".to_string())]
        );
        assert_eq!(page.clicks.lock().last().map(String::as_str), Some(VERIFY_BUTTON));
    }

    #[tokio::test]
    async fn invisible_variant_without_token_is_unsolved() {
        let page = ScriptedPage::default().present("#recaptcha-anchor");
        let outcome = run(&solver(Arc::new(FixedSpeech)), ChallengeKind::RecaptchaV3, Some(&page))
            .await
            .unwrap();
        assert!(!outcome.is_solved());
        assert!(page.clicks.lock().is_empty());
    }
}
