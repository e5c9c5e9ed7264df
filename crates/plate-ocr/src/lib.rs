use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GrayImage};
use thiserror::Error;

pub mod remote;
pub mod validator;

#[cfg(feature = "tesseract")]
mod tesseract;

pub use remote::RemoteRecognizer;
#[cfg(feature = "tesseract")]
pub use tesseract::TesseractRecognizer;
pub use validator::is_valid_plate;

/// Recognized text shorter than this is discarded as noise.
pub const MIN_PLATE_CHARS: usize = 4;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Failed to initialize OCR engine: {0}")]
    InitError(String),
    #[error("Failed to process image: {0}")]
    ImageProcessError(String),
    #[error("OCR processing error: {0}")]
    ProcessingError(String),
    #[error("OCR service request failed: {0}")]
    ApiError(String),
    #[error("OCR engine not ready")]
    NotReady,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlateText {
    /// Cleaned text: CJK ideographs, `A-Z` and `0-9` only.
    pub text: String,
    pub confidence: f32,
}

/// Text recognizer for cropped plate images.
///
/// `is_ready` must be checked before every `recognize` call. An unready
/// recognizer means "no text this frame", not an error.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn recognize(&self, crop: &DynamicImage) -> Result<Option<PlateText>, OcrError>;
}

/// Recognizer that never becomes ready; used when the real engine failed to
/// start.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRecognizer;

#[async_trait]
impl Recognizer for UnavailableRecognizer {
    fn is_ready(&self) -> bool {
        false
    }

    async fn recognize(&self, _crop: &DynamicImage) -> Result<Option<PlateText>, OcrError> {
        Err(OcrError::NotReady)
    }
}

fn is_plate_char(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fa5}' | 'A'..='Z' | '0'..='9')
}

/// Strips everything but plate characters. Returns `None` when fewer than
/// [`MIN_PLATE_CHARS`] survive.
pub fn clean_text(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| is_plate_char(*c)).collect();
    if cleaned.chars().count() < MIN_PLATE_CHARS {
        return None;
    }
    Some(cleaned)
}

/// Builds the two grayscale inputs tried by in-process engines: the upscaled
/// crop and its inverse, for dark-on-light and light-on-dark plates.
pub fn preprocess_variants(crop: &DynamicImage) -> Vec<GrayImage> {
    let upscaled = crop.resize(
        crop.width().saturating_mul(3).max(1),
        crop.height().saturating_mul(3).max(1),
        FilterType::CatmullRom,
    );
    let gray = upscaled.to_luma8();
    let mut inverted = gray.clone();
    image::imageops::invert(&mut inverted);
    vec![gray, inverted]
}
