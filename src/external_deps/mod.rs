//! Integrations that rely on third-party runtimes or services.
//!
//! This module groups the seams the fetch engine consumes from the outside
//! world: browser automation drivers, the shared rate-limit store, OCR engines
//! and speech recognisers. Concrete bindings that pull heavy dependencies are
//! gated behind cargo features.

pub mod browser;
pub mod ocr;
pub mod speech;
pub mod store;

pub use browser::{
    BlockingBrowser, BrowserDriver, BrowserError, BrowserPage, BrowserSnapshot, ContextOptions,
    Geolocation, LaunchProfile, Viewport,
};
pub use ocr::{OcrEngine, OcrError};
pub use speech::{NoSpeechRecognizer, SpeechError, SpeechRecognizer};
pub use store::{BucketRequest, SharedBucketStore, StoreError, TOKEN_BUCKET_SCRIPT};
