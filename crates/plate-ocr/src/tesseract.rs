use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageOutputFormat};
use leptess::{LepTess, Variable};
use tracing::{debug, error, info};

use crate::{clean_text, preprocess_variants, OcrError, PlateText, Recognizer};

/// In-process Tesseract recognizer. The engine loads in the background and
/// the recognizer reports unready until it has.
pub struct TesseractRecognizer {
    engine: Arc<Mutex<Option<LepTess>>>,
    ready: Arc<AtomicBool>,
}

impl TesseractRecognizer {
    pub fn spawn(language: String) -> Arc<Self> {
        let recognizer = Arc::new(Self {
            engine: Arc::new(Mutex::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
        });

        let engine = Arc::clone(&recognizer.engine);
        let ready = Arc::clone(&recognizer.ready);
        tokio::task::spawn_blocking(move || {
            info!("Initializing Tesseract OCR engine ({})", language);
            match init_engine(&language) {
                Ok(tess) => {
                    if let Ok(mut slot) = engine.lock() {
                        *slot = Some(tess);
                        ready.store(true, Ordering::SeqCst);
                        info!("Tesseract OCR engine ready");
                    }
                }
                Err(e) => error!("Tesseract initialization failed: {}", e),
            }
        });

        recognizer
    }
}

fn init_engine(language: &str) -> Result<LepTess, OcrError> {
    let mut tesseract =
        LepTess::new(None, language).map_err(|e| OcrError::InitError(e.to_string()))?;
    tesseract
        .set_variable(Variable::TesseditPagesegMode, "7")
        .map_err(|e| OcrError::InitError(e.to_string()))?;
    Ok(tesseract)
}

fn read_variant(tess: &mut LepTess, variant: &GrayImage) -> Result<Option<PlateText>, OcrError> {
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(variant.clone())
        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| OcrError::ImageProcessError(e.to_string()))?;

    tess.set_image_from_mem(&png)
        .map_err(|e| OcrError::ProcessingError(e.to_string()))?;
    let raw = tess
        .get_utf8_text()
        .map_err(|e| OcrError::ProcessingError(e.to_string()))?;
    let confidence = tess.mean_text_conf() as f32 / 100.0;

    debug!("OCR raw: {}, confidence: {:.2}", raw.trim(), confidence);
    Ok(clean_text(&raw).map(|text| PlateText { text, confidence }))
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn recognize(&self, crop: &DynamicImage) -> Result<Option<PlateText>, OcrError> {
        let engine = Arc::clone(&self.engine);
        let variants = preprocess_variants(crop);

        tokio::task::spawn_blocking(move || {
            let mut guard = engine
                .lock()
                .map_err(|_| OcrError::ProcessingError("engine lock poisoned".into()))?;
            let tess = guard.as_mut().ok_or(OcrError::NotReady)?;

            let mut best: Option<PlateText> = None;
            for variant in &variants {
                if let Some(candidate) = read_variant(tess, variant)? {
                    if best
                        .as_ref()
                        .map_or(true, |b| candidate.confidence > b.confidence)
                    {
                        best = Some(candidate);
                    }
                }
            }
            Ok(best)
        })
        .await
        .map_err(|e| OcrError::ProcessingError(e.to_string()))?
    }
}
