//! Image captcha solver.
//!
//! The captcha image is decoded, turned into a handful of preprocessed
//! variants (grayscale, binarized, denoised, contrast stretched) and each
//! variant is sent through the configured [`OcrEngine`]. The most common
//! cleaned reading wins.

use std::collections::HashMap;
use std::sync::Arc;

use ::image::{DynamicImage, GrayImage, Luma};
use async_trait::async_trait;
use log::debug;

use super::{ChallengeSolver, SolverError, clean_solution};
use crate::challenges::core::{ChallengeInput, SolveOutcome};
use crate::external_deps::OcrEngine;
use crate::external_deps::ocr::ALPHANUMERIC_WHITELIST;

pub const BINARIZE_THRESHOLD: u8 = 128;

pub struct ImageCaptchaSolver {
    ocr: Option<Arc<dyn OcrEngine>>,
    min_len: usize,
}

impl ImageCaptchaSolver {
    pub fn new(min_len: usize) -> Self {
        Self { ocr: None, min_len }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }
}

#[async_trait]
impl ChallengeSolver for ImageCaptchaSolver {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn solve(&self, input: &ChallengeInput<'_>) -> Result<SolveOutcome, SolverError> {
        let Some(ocr) = self.ocr.clone() else {
            return Ok(SolveOutcome::unsolved("no ocr engine configured"));
        };
        let source = input
            .info
            .resource
            .as_deref()
            .ok_or(SolverError::MissingResource("captcha image source"))?;
        let bytes = input.loader.load(source, input.url, input.page).await?;

        let min_len = self.min_len;
        let reading = tokio::task::spawn_blocking(move || {
            recognize_bytes(&bytes, ocr.as_ref(), min_len)
        })
        .await
        .map_err(|err| SolverError::Worker(err.to_string()))??;

        Ok(match reading {
            Some(answer) => SolveOutcome::Solved { answer },
            None => SolveOutcome::unsolved("ocr produced no usable reading"),
        })
    }
}

/// Decode `bytes` and vote over OCR readings of every preprocessing variant.
pub fn recognize_bytes(
    bytes: &[u8],
    ocr: &dyn OcrEngine,
    min_len: usize,
) -> Result<Option<String>, SolverError> {
    let decoded = ::image::load_from_memory(bytes)?;
    let mut readings = Vec::new();
    let mut last_error = None;

    for (index, variant) in preprocess_variants(&decoded).iter().enumerate() {
        match ocr.recognize(variant, ALPHANUMERIC_WHITELIST) {
            Ok(raw) => {
                let cleaned = clean_solution(&raw);
                debug!("ocr variant {} via {} read {:?}", index, ocr.name(), cleaned);
                if cleaned.len() >= min_len {
                    readings.push(cleaned);
                }
            }
            Err(err) => {
                debug!("ocr variant {} failed: {}", index, err);
                last_error = Some(err);
            }
        }
    }

    match (vote(&readings), last_error) {
        (Some(best), _) => Ok(Some(best)),
        (None, Some(err)) if readings.is_empty() => Err(err.into()),
        (None, _) => Ok(None),
    }
}

pub fn preprocess_variants(image: &DynamicImage) -> Vec<GrayImage> {
    let gray = image.to_luma8();
    let binary = binarize(&gray, BINARIZE_THRESHOLD);
    let denoised = median_denoise(&binary);
    let stretched = binarize(&stretch_contrast(&gray), BINARIZE_THRESHOLD);
    vec![gray, binary, denoised, stretched]
}

/// Pixels above `threshold` become white, the rest black.
pub fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// 3x3 median filter with edge pixels clamped.
pub fn median_denoise(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut window = [0u8; 9];
        let mut n = 0;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let nx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                let ny = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
                window[n] = image.get_pixel(nx, ny)[0];
                n += 1;
            }
        }
        window.sort_unstable();
        Luma([window[4]])
    })
}

/// Linear stretch of the luminance range to 0..=255.
pub fn stretch_contrast(image: &GrayImage) -> GrayImage {
    let (min, max) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max <= min {
        return image.clone();
    }
    let span = (max - min) as f32;
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get_pixel(x, y)[0];
        Luma([(((value - min) as f32 / span) * 255.0).round() as u8])
    })
}

/// Most frequent reading; ties go to the earliest one.
fn vote(readings: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for reading in readings {
        *counts.entry(reading.as_str()).or_default() += 1;
    }
    let best = counts.values().copied().max()?;
    readings
        .iter()
        .find(|reading| counts[reading.as_str()] == best)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::{ChallengeInfo, ChallengeKind, ResourceLoader};
    use crate::external_deps::OcrError;
    use ::image::ImageFormat;
    use base64::Engine as _;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::time::Duration;

    struct StubOcr {
        readings: Mutex<Vec<Result<String, OcrError>>>,
        seen_binary: Mutex<usize>,
    }

    impl StubOcr {
        fn new(readings: Vec<Result<String, OcrError>>) -> Self {
            Self {
                readings: Mutex::new(readings),
                seen_binary: Mutex::new(0),
            }
        }
    }

    impl OcrEngine for StubOcr {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String, OcrError> {
            assert_eq!(whitelist, ALPHANUMERIC_WHITELIST);
            if image.pixels().all(|p| p[0] == 0 || p[0] == 255) {
                *self.seen_binary.lock() += 1;
            }
            let mut readings = self.readings.lock();
            if readings.is_empty() {
                Ok(String::new())
            } else {
                readings.remove(0)
            }
        }
    }

    fn sample_png() -> Vec<u8> {
        let image = GrayImage::from_fn(12, 8, |x, _| Luma([(x * 20) as u8]));
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn binarize_splits_at_threshold() {
        let image = GrayImage::from_raw(3, 1, vec![10, 128, 129]).unwrap();
        let binary = binarize(&image, BINARIZE_THRESHOLD);
        assert_eq!(binary.into_raw(), vec![0, 0, 255]);
    }

    #[test]
    fn median_removes_salt_noise() {
        let mut image = GrayImage::from_pixel(3, 3, Luma([0]));
        image.put_pixel(1, 1, Luma([255]));
        let cleaned = median_denoise(&image);
        assert_eq!(cleaned.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn stretch_maps_range_to_full_scale() {
        let image = GrayImage::from_raw(2, 1, vec![100, 150]).unwrap();
        assert_eq!(stretch_contrast(&image).into_raw(), vec![0, 255]);
    }

    #[test]
    fn vote_prefers_majority_then_first() {
        let readings = vec!["ab12".to_string(), "xy99".to_string(), "xy99".to_string()];
        assert_eq!(vote(&readings).as_deref(), Some("xy99"));
        let tie = vec!["ab12".to_string(), "xy99".to_string()];
        assert_eq!(vote(&tie).as_deref(), Some("ab12"));
        assert!(vote(&[]).is_none());
    }

    #[test]
    fn recognizes_cleaned_majority_reading() {
        let ocr = StubOcr::new(vec![
            Ok("k7 P-2x".into()),
            Ok("k7P2x\n".into()),
            Ok("abc".into()),
            Err(OcrError::Engine("blurry".into())),
        ]);
        let reading = recognize_bytes(&sample_png(), &ocr, 4).unwrap();
        assert_eq!(reading.as_deref(), Some("k7P2x"));
        assert!(*ocr.seen_binary.lock() >= 2);
    }

    #[test]
    fn short_readings_are_rejected() {
        let ocr = StubOcr::new(vec![Ok("ab".into()), Ok("a-b".into())]);
        assert_eq!(recognize_bytes(&sample_png(), &ocr, 4).unwrap(), None);
    }

    #[test]
    fn all_engine_failures_surface_as_error() {
        let ocr = StubOcr::new((0..4).map(|_| Err(OcrError::Engine("down".into()))).collect());
        assert!(matches!(
            recognize_bytes(&sample_png(), &ocr, 4),
            Err(SolverError::Ocr(_))
        ));
    }

    #[tokio::test]
    async fn solves_inline_image_with_stub_ocr() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(sample_png());
        let mut info = ChallengeInfo::new(ChallengeKind::ImageCaptcha);
        info.resource = Some(format!("data:image/png;base64,{encoded}"));
        let loader = ResourceLoader::new(Duration::from_secs(1));
        let input = ChallengeInput {
            info: &info,
            url: "https://example.com/login",
            body: "",
            page: None,
            loader: &loader,
        };

        let solver = ImageCaptchaSolver::new(4)
            .with_ocr(Arc::new(StubOcr::new(vec![Ok(" QX4 9 ".into())])));
        let outcome = solver.solve(&input).await.unwrap();
        assert_eq!(outcome.answer(), Some("QX49"));
    }

    #[tokio::test]
    async fn without_engine_is_unsolved() {
        let info = ChallengeInfo::new(ChallengeKind::ImageCaptcha);
        let loader = ResourceLoader::new(Duration::from_secs(1));
        let input = ChallengeInput {
            info: &info,
            url: "https://example.com/",
            body: "",
            page: None,
            loader: &loader,
        };
        let outcome = ImageCaptchaSolver::new(4).solve(&input).await.unwrap();
        assert!(!outcome.is_solved());
    }
}
