//! Managed verification wall ("checking your browser") handling.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use super::{ChallengeSolver, SolverError};
use crate::challenges::core::{ChallengeInput, SolveOutcome};
use crate::challenges::detectors::is_interstitial;

const TURNSTILE_WIDGET: &str = ".cf-turnstile";
const TURNSTILE_CHECKBOX: &str = r#"input[type="checkbox"]"#;

/// Polls a live page until the interstitial markers disappear.
#[derive(Debug, Clone)]
pub struct InterstitialSolver {
    polls: u32,
    interval: Duration,
}

impl InterstitialSolver {
    pub fn new(polls: u32, interval: Duration) -> Self {
        Self {
            polls: polls.max(1),
            interval,
        }
    }
}

impl Default for InterstitialSolver {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(1))
    }
}

#[async_trait]
impl ChallengeSolver for InterstitialSolver {
    fn name(&self) -> &'static str {
        "interstitial"
    }

    async fn solve(&self, input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError> {
        let Some(page) = input.page else {
            return Ok(SolveOutcome::unsolved("interstitial needs a live browser page"));
        };

        let mut clicked = false;
        for poll in 0..self.polls {
            let content = page.content().await?;
            if !is_interstitial(&content) {
                info!("interstitial cleared after {} poll(s) on {}", poll + 1, input.url);
                return Ok(SolveOutcome::Cleared);
            }

            // Best effort: a visible turnstile widget gets one click.
            if !clicked && page.exists(TURNSTILE_WIDGET).await.unwrap_or(false) {
                clicked = page.click(TURNSTILE_CHECKBOX).await.unwrap_or(false);
                debug!("turnstile checkbox click on {}: {}", input.url, clicked);
            }

            tokio::time::sleep(self.interval).await;
        }

        Ok(SolveOutcome::unsolved(format!(
            "interstitial still present after {} polls",
            self.polls
        )))
    }
}
