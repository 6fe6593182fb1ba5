//! Placeholder for challenge families without an automated solution.

use async_trait::async_trait;

use super::{ChallengeSolver, SolverError};
use crate::challenges::core::{ChallengeInput, SolveOutcome};

/// Always reports the challenge as unsolved.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedSolver {
    family: &'static str,
}

impl UnsupportedSolver {
    pub fn new(family: &'static str) -> Self {
        Self { family }
    }
}

#[async_trait]
impl ChallengeSolver for UnsupportedSolver {
    fn name(&self) -> &'static str {
        self.family
    }

    async fn solve(&self, _input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError> {
        Ok(SolveOutcome::unsolved(format!(
            "no automated solver for {}",
            self.family
        )))
    }
}
