//! Settings and configuration module
//!
//! Provides the engine configuration with:
//! - Serde defaults for every knob
//! - JSON loading from strings or files
//! - Validation of values the engine cannot work with

pub mod settings;

pub use settings::{
    BrowserConfig, ChallengeConfig, ConfigError, EngineConfig, RetryConfig,
};
