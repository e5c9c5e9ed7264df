#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, RgbImage};
use plate_ocr::{OcrError, PlateText, Recognizer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use yolo_detector::{BoundingBox, Detection, Detector, DetectorError};

use parking_sentry::config::{LedgerSettings, PipelineSettings};
use parking_sentry::error::{Error, Result};
use parking_sentry::ledger::Ledger;
use parking_sentry::source::{FrameSource, SourceFactory};
use parking_sentry::worker::{PipelineContext, WorkerSettings};

pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;

pub fn frame() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT))
}

pub fn plate_detection(label: &str) -> Detection {
    Detection {
        label: label.to_string(),
        confidence: 0.9,
        bbox: BoundingBox::new(10.0, 10.0, 40.0, 30.0),
    }
}

pub async fn ledger() -> Ledger {
    let ledger = Ledger::connect_in_memory().await.unwrap();
    ledger
        .seed_system_config(&LedgerSettings::default(), Utc::now())
        .await
        .unwrap();
    ledger
}

/// Fails the first `failures` reads, then yields blank frames.
pub struct ScriptedSource {
    failures: usize,
    reads: Arc<AtomicUsize>,
    reacquires: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            reads: Arc::new(AtomicUsize::new(0)),
            reacquires: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn reacquires(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reacquires)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn read_frame(&mut self) -> Result<DynamicImage> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        if read < self.failures {
            return Err(Error::Capture("camera offline".into()));
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(frame())
    }

    async fn reacquire(&mut self) -> Result<()> {
        self.reacquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Source whose first read panics, ending the worker task.
pub struct PanickingSource;

#[async_trait]
impl FrameSource for PanickingSource {
    async fn read_frame(&mut self) -> Result<DynamicImage> {
        panic!("source crashed");
    }

    async fn reacquire(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counts opens. The first `panicking` sources it hands out crash on read.
#[derive(Default)]
pub struct CountingFactory {
    pub opens: AtomicUsize,
    pub panicking: usize,
}

impl CountingFactory {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceFactory for CountingFactory {
    fn open(&self, _camera_id: i64, _source_uri: &str) -> Box<dyn FrameSource> {
        let opened = self.opens.fetch_add(1, Ordering::SeqCst);
        if opened < self.panicking {
            Box::new(PanickingSource)
        } else {
            Box::new(ScriptedSource::new(0))
        }
    }
}

pub struct FakeDetector {
    detections: Vec<Detection>,
    failing: bool,
    calls: AtomicUsize,
}

impl FakeDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call returns an inference error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(vec![plate_detection("blue")])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(
        &self,
        _frame: &DynamicImage,
        _confidence_threshold: f32,
        _iou_threshold: f32,
    ) -> std::result::Result<Vec<Detection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(DetectorError::InferenceError("session crashed".into()));
        }
        Ok(self.detections.clone())
    }
}

pub struct FakeRecognizer {
    ready: AtomicBool,
    failing: AtomicBool,
    text: Option<String>,
    calls: AtomicUsize,
}

impl FakeRecognizer {
    pub fn new(ready: bool, text: Option<&str>) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            failing: AtomicBool::new(false),
            text: text.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }

    /// While set, `recognize` returns a request error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn recognize(
        &self,
        _crop: &DynamicImage,
    ) -> std::result::Result<Option<PlateText>, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone().map(|text| PlateText {
            text,
            confidence: 0.93,
        }))
    }
}

pub fn worker_settings(sample_interval: u64) -> WorkerSettings {
    let mut settings = WorkerSettings::from(&PipelineSettings {
        sample_interval,
        ..PipelineSettings::default()
    });
    settings.reconnect_backoff = Duration::from_millis(5);
    settings.loop_delay = Duration::from_millis(1);
    settings
}

pub fn context(
    ledger: Ledger,
    detector: Arc<dyn Detector>,
    recognizer: Arc<dyn Recognizer>,
    sources: Arc<dyn SourceFactory>,
    sample_interval: u64,
) -> PipelineContext {
    PipelineContext {
        ledger,
        detector,
        recognizer,
        sources,
        settings: worker_settings(sample_interval),
    }
}

/// Polls `condition` every few milliseconds for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
