//! Bot-challenge detection and resolution.
//!
//! [`detectors`] recognises challenge pages with a cheap text scan,
//! [`solvers`] holds one solver per challenge family and [`pipeline`] glues
//! them together behind [`ChallengeResolver`].

pub mod core;
pub mod detectors;
pub mod pipeline;
pub mod solvers;

pub use self::core::{ChallengeInfo, ChallengeInput, ChallengeKind, ResourceLoader, SolveOutcome};
pub use detectors::{ChallengeDetector, DetectionLogEntry, is_interstitial};
pub use pipeline::ChallengeResolver;
pub use solvers::{ChallengeSolver, SolverError};
