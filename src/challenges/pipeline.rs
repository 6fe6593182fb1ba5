//! Challenge resolution pipeline.
//!
//! Brings together the detector and one solver per challenge family in a
//! single entry point. Whatever a solver does, the resolver hands back a
//! [`SolveOutcome`]: solver errors become `Unsolved` with the error text as
//! the reason, so callers treat them like any other failed attempt.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::challenges::core::{
    ChallengeInfo, ChallengeInput, ChallengeKind, ResourceLoader, SolveOutcome,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::solvers::{
    AudioCaptchaSolver, ChallengeSolver, ImageCaptchaSolver, InterstitialSolver, RecaptchaSolver,
    UnsupportedSolver,
};
use crate::config::ChallengeConfig;
use crate::external_deps::{BrowserPage, NoSpeechRecognizer, OcrEngine, SpeechRecognizer};
use crate::modules::events::{EventDispatcher, FetchEvent};
use crate::transport::HttpTransport;

/// Coordinates challenge detection and solver selection.
pub struct ChallengeResolver {
    config: ChallengeConfig,
    detector: ChallengeDetector,
    solvers: HashMap<ChallengeKind, Arc<dyn ChallengeSolver>>,
    loader: ResourceLoader,
    ocr: Option<Arc<dyn OcrEngine>>,
    speech: Arc<dyn SpeechRecognizer>,
    events: EventDispatcher,
}

impl ChallengeResolver {
    /// Resolver with the stock solvers: no OCR engine, no speech recogniser.
    pub fn new(config: ChallengeConfig) -> Self {
        let loader = ResourceLoader::new(config.media_timeout());
        let mut resolver = Self {
            config,
            detector: ChallengeDetector::new(),
            solvers: HashMap::new(),
            loader,
            ocr: None,
            speech: Arc::new(NoSpeechRecognizer),
            events: EventDispatcher::new(),
        };
        resolver.install_default_solvers();
        resolver
    }

    fn install_default_solvers(&mut self) {
        let mut image = ImageCaptchaSolver::new(self.config.min_solution_len);
        if let Some(ocr) = &self.ocr {
            image = image.with_ocr(Arc::clone(ocr));
        }
        let recaptcha: Arc<dyn ChallengeSolver> = Arc::new(RecaptchaSolver::new(
            Arc::clone(&self.speech),
            self.config.recaptcha_settle(),
        ));

        self.solvers.insert(ChallengeKind::ImageCaptcha, Arc::new(image));
        self.solvers.insert(
            ChallengeKind::AudioCaptcha,
            Arc::new(AudioCaptchaSolver::new(Arc::clone(&self.speech))),
        );
        self.solvers
            .insert(ChallengeKind::RecaptchaV2, Arc::clone(&recaptcha));
        self.solvers.insert(ChallengeKind::RecaptchaV3, recaptcha);
        self.solvers.insert(
            ChallengeKind::Hcaptcha,
            Arc::new(UnsupportedSolver::new("hcaptcha")),
        );
        self.solvers.insert(
            ChallengeKind::Interstitial,
            Arc::new(InterstitialSolver::new(
                self.config.interstitial_polls,
                self.config.interstitial_poll_interval(),
            )),
        );
    }

    /// Attach an OCR engine for image captchas.
    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self.install_default_solvers();
        self
    }

    /// Replace the speech recogniser used by audio captchas and the
    /// reCAPTCHA audio sub-flow.
    pub fn with_speech(mut self, speech: Arc<dyn SpeechRecognizer>) -> Self {
        self.speech = speech;
        self.install_default_solvers();
        self
    }

    /// Transport used to download captcha media when no page is live.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.loader = self.loader.with_transport(transport);
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Override the solver for one challenge family.
    pub fn with_solver(mut self, kind: ChallengeKind, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solvers.insert(kind, solver);
        self
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    pub fn detector(&self) -> &ChallengeDetector {
        &self.detector
    }

    pub fn detect(&self, url: &str, body: &str) -> Option<ChallengeInfo> {
        self.detector.detect(url, body)
    }

    /// True when a body is short enough to be worth scanning for challenges.
    pub fn is_suspicious(&self, body_len: usize) -> bool {
        body_len < self.config.suspicion_threshold_bytes
    }

    /// Run the solver registered for `info.kind`.
    pub async fn resolve(
        &self,
        info: &ChallengeInfo,
        url: &str,
        body: &str,
        page: Option<&dyn BrowserPage>,
    ) -> SolveOutcome {
        let outcome = match self.solvers.get(&info.kind) {
            Some(solver) => {
                debug!("solving {} challenge on {} with {}", info.kind, url, solver.name());
                let input = ChallengeInput {
                    info,
                    url,
                    body,
                    page,
                    loader: &self.loader,
                };
                match solver.solve(&input).await {
                    Ok(outcome) => outcome,
                    Err(err) => SolveOutcome::unsolved(err.to_string()),
                }
            }
            None => SolveOutcome::unsolved(format!("no solver registered for {}", info.kind)),
        };

        let detail = match &outcome {
            SolveOutcome::Unsolved { reason } => Some(reason.clone()),
            _ => None,
        };
        if outcome.is_solved() {
            info!("{} challenge solved on {}", info.kind, url);
        } else {
            debug!("{} challenge unsolved on {}: {:?}", info.kind, url, detail);
        }
        self.events.dispatch(FetchEvent::challenge(
            url,
            info.kind.name(),
            outcome.is_solved(),
            detail,
        ));
        outcome
    }
}

impl Default for ChallengeResolver {
    fn default() -> Self {
        Self::new(ChallengeConfig::default())
    }
}

impl std::fmt::Debug for ChallengeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResolver")
            .field("config", &self.config)
            .field("solvers", &self.solvers.len())
            .field("has_ocr", &self.ocr.is_some())
            .field("speech", &self.speech.name())
            .finish()
    }
}
