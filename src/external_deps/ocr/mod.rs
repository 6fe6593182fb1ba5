//! OCR engine seam used by the image captcha solver.
//!
//! No engine ships with the crate; callers plug in whatever recogniser they
//! have (tesseract bindings, an ONNX model, a remote service...).

use image::GrayImage;
use thiserror::Error;

/// Character set captcha images are restricted to.
pub const ALPHANUMERIC_WHITELIST: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("ocr engine failed: {0}")]
    Engine(String),
    #[error("ocr engine {0} not implemented")]
    NotImplemented(&'static str),
}

/// Recognises text in a preprocessed (grayscale/binarized) image.
///
/// Calls are CPU bound; the solver runs them on a blocking worker.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String, OcrError>;
}
