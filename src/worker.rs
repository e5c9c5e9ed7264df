//! Per-camera capture/detect/recognize loop.
//!
//! State machine: `Connecting -> Streaming <-> Recovering -> Stopped`. The
//! worker checks its run flag once per iteration, so a stop takes effect at
//! the top of the next loop. Nothing that fails inside an iteration ends the
//! worker; failures are logged and reported as [`StepOutcome::TransientFailure`].

use chrono::{DateTime, Utc};
use image::DynamicImage;
use plate_ocr::Recognizer;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use yolo_detector::{detect_or_empty, draw_detections, Detection, Detector};

use crate::broadcast::{encode_jpeg, FrameBuffer};
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::events::{PlateEventResolver, PlateOutcome};
use crate::ledger::Ledger;
use crate::models::{CameraRole, Reading};
use crate::source::{FrameSource, SourceFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Connecting = 0,
    Streaming = 1,
    Recovering = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Connecting,
            1 => WorkerState::Streaming,
            2 => WorkerState::Recovering,
            _ => WorkerState::Stopped,
        }
    }
}

/// Everything a worker publishes for the outside world.
#[derive(Debug)]
pub struct WorkerFeed {
    frames: Arc<FrameBuffer>,
    reading: RwLock<Option<Reading>>,
    state: AtomicU8,
}

impl Default for WorkerFeed {
    fn default() -> Self {
        Self {
            frames: Arc::new(FrameBuffer::default()),
            reading: RwLock::new(None),
            state: AtomicU8::new(WorkerState::Connecting as u8),
        }
    }
}

impl WorkerFeed {
    pub fn frames(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.frames)
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.reading
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) -> WorkerState {
        WorkerState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    fn set_reading(&self, reading: Reading) {
        *self.reading.write().unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub sample_interval: u64,
    pub crop_padding: u32,
    pub debounce_window: chrono::Duration,
    pub entry_guard: chrono::Duration,
    pub reconnect_backoff: Duration,
    pub loop_delay: Duration,
    pub jpeg_quality: u8,
}

impl From<&PipelineSettings> for WorkerSettings {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            sample_interval: settings.sample_interval.max(1),
            crop_padding: settings.crop_padding,
            debounce_window: chrono::Duration::seconds(settings.debounce_secs),
            entry_guard: chrono::Duration::seconds(settings.entry_guard_secs),
            reconnect_backoff: Duration::from_millis(settings.reconnect_backoff_ms),
            loop_delay: Duration::from_millis(settings.loop_delay_ms),
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub ledger: Ledger,
    pub detector: Arc<dyn Detector>,
    pub recognizer: Arc<dyn Recognizer>,
    pub sources: Arc<dyn SourceFactory>,
    pub settings: WorkerSettings,
}

/// Result of a sampling pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    NoDetections,
    RecognizerNotReady,
    NoText,
    Event { plate: String, outcome: PlateOutcome },
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Detector skipped, cached boxes drawn.
    Reused,
    Sampled(SampleOutcome),
    TransientFailure(String),
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    confidence: f32,
    iou: f32,
}

pub struct CameraWorker {
    camera_id: i64,
    ctx: PipelineContext,
    source: Box<dyn FrameSource>,
    resolver: PlateEventResolver,
    running: Arc<AtomicBool>,
    feed: Arc<WorkerFeed>,
    frame_count: u64,
    detections: Vec<Detection>,
    thresholds: Thresholds,
}

impl CameraWorker {
    pub fn new(
        ctx: PipelineContext,
        camera_id: i64,
        role: CameraRole,
        source: Box<dyn FrameSource>,
        running: Arc<AtomicBool>,
        feed: Arc<WorkerFeed>,
    ) -> Self {
        let resolver = PlateEventResolver::new(
            ctx.ledger.clone(),
            camera_id,
            role,
            ctx.settings.debounce_window,
            ctx.settings.entry_guard,
        );

        Self {
            camera_id,
            ctx,
            source,
            resolver,
            running,
            feed,
            frame_count: 0,
            detections: Vec::new(),
            thresholds: Thresholds {
                confidence: 0.5,
                iou: 0.45,
            },
        }
    }

    pub async fn run(mut self) {
        info!(camera_id = self.camera_id, role = %self.resolver.role(), "Camera worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.source.read_frame().await {
                Ok(frame) => {
                    if self.feed.set_state(WorkerState::Streaming) != WorkerState::Streaming {
                        info!(camera_id = self.camera_id, "Camera streaming");
                    }
                    let outcome = self.process_frame(frame, Utc::now()).await;
                    trace!(camera_id = self.camera_id, ?outcome, "Frame processed");
                }
                Err(e) => {
                    if self.feed.set_state(WorkerState::Recovering) != WorkerState::Recovering {
                        warn!(camera_id = self.camera_id, "Frame read failed, recovering: {}", e);
                    }
                    tokio::time::sleep(self.ctx.settings.reconnect_backoff).await;
                    if let Err(e) = self.source.reacquire().await {
                        debug!(camera_id = self.camera_id, "Reconnect failed: {}", e);
                    }
                    continue;
                }
            }

            tokio::time::sleep(self.ctx.settings.loop_delay).await;
        }

        self.feed.set_state(WorkerState::Stopped);
        info!(camera_id = self.camera_id, "Camera worker stopped");
    }

    /// Samples (every Nth frame), overlays and publishes one frame.
    pub async fn process_frame(&mut self, frame: DynamicImage, now: DateTime<Utc>) -> StepOutcome {
        self.frame_count += 1;

        let mut outcome = StepOutcome::Reused;
        if self.frame_count % self.ctx.settings.sample_interval == 0 {
            outcome = match self.sample(&frame, now).await {
                Ok(sampled) => StepOutcome::Sampled(sampled),
                Err(e) => {
                    warn!(camera_id = self.camera_id, "Sampling failed: {}", e);
                    StepOutcome::TransientFailure(e.to_string())
                }
            };
        }

        let mut annotated = frame.into_rgb8();
        draw_detections(&mut annotated, &self.detections);
        match encode_jpeg(&annotated, self.ctx.settings.jpeg_quality) {
            Ok(jpeg) => self.feed.frames.publish(jpeg),
            Err(e) => {
                warn!(camera_id = self.camera_id, "Frame encoding failed: {}", e);
                if !matches!(outcome, StepOutcome::TransientFailure(_)) {
                    outcome = StepOutcome::TransientFailure(e.to_string());
                }
            }
        }

        outcome
    }

    async fn sample(&mut self, frame: &DynamicImage, now: DateTime<Utc>) -> Result<SampleOutcome> {
        let thresholds = self.refresh_thresholds().await;
        self.detections = detect_or_empty(
            self.ctx.detector.as_ref(),
            frame,
            thresholds.confidence,
            thresholds.iou,
        )
        .await;

        // First entry by detector order, not highest confidence.
        let Some(first) = self.detections.first().cloned() else {
            return Ok(SampleOutcome::NoDetections);
        };

        if !self.ctx.recognizer.is_ready() {
            return Ok(SampleOutcome::RecognizerNotReady);
        }

        let padding = self.ctx.settings.crop_padding;
        let Some(region) = first.bbox.padded_region(padding, frame.width(), frame.height()) else {
            return Ok(SampleOutcome::NoDetections);
        };
        let crop = frame.crop_imm(region.x, region.y, region.width, region.height);

        let text = match self.ctx.recognizer.recognize(&crop).await? {
            Some(text) if !text.text.is_empty() => text,
            _ => return Ok(SampleOutcome::NoText),
        };

        self.feed.set_reading(Reading {
            plate: text.text.clone(),
            timestamp: now,
            confidence: text.confidence,
            plate_type: first.label.clone(),
        });

        let outcome = self.resolver.resolve(&text.text, &first.label, now).await?;
        Ok(SampleOutcome::Event {
            plate: text.text,
            outcome,
        })
    }

    async fn refresh_thresholds(&mut self) -> Thresholds {
        match self.ctx.ledger.system_config().await {
            Ok(config) => {
                self.thresholds = Thresholds {
                    confidence: config.conf_thres as f32,
                    iou: config.iou_thres as f32,
                };
            }
            Err(e) => {
                debug!(camera_id = self.camera_id, "Using last known thresholds: {}", e);
            }
        }
        self.thresholds
    }
}

/// Handle the registry keeps for a spawned worker.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    feed: Arc<WorkerFeed>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawns a worker for `camera_id` on `runtime`. The camera role is read
    /// once, from the ledger, when the task starts.
    pub fn spawn(
        runtime: &Handle,
        ctx: PipelineContext,
        camera_id: i64,
        source_uri: String,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let feed = Arc::new(WorkerFeed::default());

        let task = runtime.spawn({
            let running = Arc::clone(&running);
            let feed = Arc::clone(&feed);
            async move {
                let role = load_role(&ctx.ledger, camera_id).await;
                let source = ctx.sources.open(camera_id, &source_uri);
                CameraWorker::new(ctx, camera_id, role, source, running, feed)
                    .run()
                    .await;
            }
        });

        Self {
            running,
            feed,
            task,
        }
    }

    pub fn feed(&self) -> Arc<WorkerFeed> {
        Arc::clone(&self.feed)
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cooperative: the worker exits at the top of its next iteration.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn load_role(ledger: &Ledger, camera_id: i64) -> CameraRole {
    match ledger.get_camera(camera_id).await {
        Ok(Some(camera)) => camera.role,
        Ok(None) => {
            warn!(camera_id, "Camera not in database, assuming entrance");
            CameraRole::Entrance
        }
        Err(e) => {
            warn!(camera_id, "Could not read camera role, assuming entrance: {}", e);
            CameraRole::Entrance
        }
    }
}
