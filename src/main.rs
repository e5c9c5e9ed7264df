use actix_web::{web, App, HttpServer};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parking_sentry::api::{self, AppState};
use parking_sentry::broadcast::{placeholder_jpeg, FrameBroadcaster};
use parking_sentry::config::{DetectorSettings, OcrSettings, Settings};
use parking_sentry::ledger::Ledger;
use parking_sentry::registry::CameraRegistry;
use parking_sentry::retention::RetentionService;
use parking_sentry::source::FfmpegSourceFactory;
use parking_sentry::worker::{PipelineContext, WorkerSettings};
use plate_ocr::{Recognizer, RemoteRecognizer, UnavailableRecognizer};
use yolo_detector::{Detector, DisabledDetector};

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(feature = "onnx")]
fn build_detector(settings: &DetectorSettings) -> Arc<dyn Detector> {
    let Some(model_path) = &settings.model_path else {
        warn!("No detector model configured, plate detection disabled");
        return Arc::new(DisabledDetector);
    };

    match yolo_detector::OnnxPlateDetector::new(model_path, settings.labels.clone()) {
        Ok(detector) => {
            info!("Loaded plate detector from {}", model_path.display());
            Arc::new(detector)
        }
        Err(e) => {
            warn!("Plate detector unavailable, detection disabled: {}", e);
            Arc::new(DisabledDetector)
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn build_detector(settings: &DetectorSettings) -> Arc<dyn Detector> {
    if settings.model_path.is_some() {
        warn!("Built without the `onnx` feature, ignoring detector model");
    }
    Arc::new(DisabledDetector)
}

#[cfg(feature = "tesseract")]
fn local_recognizer(settings: &OcrSettings) -> Option<Arc<dyn Recognizer>> {
    let language = settings.tesseract_language.as_ref()?;
    let recognizer: Arc<dyn Recognizer> =
        plate_ocr::TesseractRecognizer::spawn(language.clone());
    Some(recognizer)
}

#[cfg(not(feature = "tesseract"))]
fn local_recognizer(settings: &OcrSettings) -> Option<Arc<dyn Recognizer>> {
    if settings.tesseract_language.is_some() {
        warn!("Built without the `tesseract` feature, using the OCR server");
    }
    None
}

fn build_recognizer(settings: &OcrSettings) -> Arc<dyn Recognizer> {
    if let Some(recognizer) = local_recognizer(settings) {
        return recognizer;
    }

    let Some(endpoint) = &settings.endpoint else {
        warn!("No OCR engine configured, plate recognition disabled");
        return Arc::new(UnavailableRecognizer);
    };

    match RemoteRecognizer::new(endpoint.clone(), settings.timeout()) {
        Ok(mut recognizer) => {
            if let Some(dir) = &settings.scratch_dir {
                recognizer = recognizer.with_scratch_dir(dir);
            }
            let recognizer = Arc::new(recognizer);
            let probe_every = Duration::from_secs(settings.probe_interval_secs.max(1));
            recognizer.spawn_readiness_probe(probe_every);
            info!("Using OCR server at {}", endpoint);
            recognizer
        }
        Err(e) => {
            warn!("OCR client unavailable, plate recognition disabled: {}", e);
            Arc::new(UnavailableRecognizer)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_logging(&settings.log_level);

    info!("Starting ParkingSentry...");

    let ledger = Ledger::connect(&settings.database).await?;
    ledger.seed_system_config(&settings.ledger, Utc::now()).await?;

    let ctx = PipelineContext {
        ledger: ledger.clone(),
        detector: build_detector(&settings.detector),
        recognizer: build_recognizer(&settings.ocr),
        sources: Arc::new(FfmpegSourceFactory::new(settings.pipeline.ffmpeg_path.clone())),
        settings: WorkerSettings::from(&settings.pipeline),
    };
    let registry = Arc::new(CameraRegistry::new(ctx, Handle::current()));

    let cameras = ledger.list_cameras().await?;
    info!("Starting {} configured cameras", cameras.len());
    for camera in &cameras {
        registry.ensure_running(camera.id, &camera.source_uri);
    }

    Arc::new(RetentionService::new(
        ledger.clone(),
        Duration::from_secs(settings.ledger.purge_interval_secs.max(1)),
    ))
    .start();

    let placeholder = placeholder_jpeg(
        settings.streaming.placeholder_width,
        settings.streaming.placeholder_height,
    )?;
    let broadcaster = Arc::new(FrameBroadcaster::new(
        Arc::clone(&registry),
        placeholder,
        (&settings.streaming).into(),
    ));

    let state = AppState {
        ledger,
        registry: Arc::clone(&registry),
        broadcaster,
    };

    info!("Listening on {}", settings.server.bind);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(api::routes)
    })
    .bind(&settings.server.bind)?
    .run()
    .await?;

    registry.stop_all();
    info!("ParkingSentry stopped");
    Ok(())
}
