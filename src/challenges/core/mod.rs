//! Core types and helpers shared across challenge detection and solving.

pub mod resource;
pub mod types;

pub use resource::{ResourceLoader, decode_data_uri};
pub use types::{ChallengeInfo, ChallengeInput, ChallengeKind, SolveOutcome};
