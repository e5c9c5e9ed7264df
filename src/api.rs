//! HTTP surface: camera management, dashboard, live readings and MJPEG feeds.

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpResponse, ResponseError};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::broadcast::{multipart_part, FrameBroadcaster, BOUNDARY};
use crate::error::Error;
use crate::ledger::Ledger;
use crate::models::NewCamera;
use crate::registry::CameraRegistry;

const DEFAULT_RECORD_LIMIT: i64 = 50;
const MAX_RECORD_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub registry: Arc<CameraRegistry>,
    pub broadcaster: Arc<FrameBroadcaster>,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed/{camera_id}", web::get().to(video_feed))
        .service(
            web::scope("/api")
                .route("/live_readings", web::get().to(live_readings))
                .route("/dashboard", web::get().to(dashboard))
                .route("/records", web::get().to(records))
                .route("/cameras", web::get().to(list_cameras))
                .route("/cameras", web::post().to(add_camera))
                .route("/cameras/{camera_id}", web::delete().to(delete_camera)),
        );
}

/// MJPEG stream of the camera's annotated frames. Opening it starts the
/// camera's worker if it is not already running.
async fn video_feed(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, Error> {
    let camera_id = path.into_inner();
    let camera = state
        .ledger
        .get_camera(camera_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

    let subscriber = state.broadcaster.subscribe(camera.id, &camera.source_uri);
    let stream = futures::stream::unfold(subscriber, |mut subscriber| async move {
        let frame = subscriber.next_frame().await?;
        let part = web::Bytes::from(multipart_part(frame.bytes()));
        Some((Ok::<_, actix_web::Error>(part), subscriber))
    });

    Ok(HttpResponse::Ok()
        .content_type(format!("multipart/x-mixed-replace; boundary={}", BOUNDARY))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

async fn live_readings(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.live_readings())
}

/// Slot summary; reading it reconciles the counter with the parked count.
async fn dashboard(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let summary = state.ledger.reconcile(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(summary))
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    limit: Option<i64>,
}

async fn records(
    state: web::Data<AppState>,
    query: web::Query<RecordsQuery>,
) -> Result<HttpResponse, Error> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECORD_LIMIT)
        .clamp(1, MAX_RECORD_LIMIT);
    let records = state.ledger.recent_records(limit).await?;
    Ok(HttpResponse::Ok().json(records))
}

async fn list_cameras(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().json(state.ledger.list_cameras().await?))
}

async fn add_camera(
    state: web::Data<AppState>,
    body: web::Json<NewCamera>,
) -> Result<HttpResponse, Error> {
    let new_camera = body.into_inner();
    if new_camera.name.trim().is_empty() || new_camera.source_uri.trim().is_empty() {
        return Err(Error::InvalidInput("name and source_uri are required".into()));
    }

    let camera = state.ledger.create_camera(&new_camera, Utc::now()).await?;
    state.registry.ensure_running(camera.id, &camera.source_uri);
    Ok(HttpResponse::Created().json(camera))
}

/// Stops the worker before the camera row goes away.
async fn delete_camera(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, Error> {
    let camera_id = path.into_inner();
    state.registry.stop(camera_id);

    if !state.ledger.delete_camera(camera_id).await? {
        return Err(Error::NotFound(format!("camera {}", camera_id)));
    }
    info!(camera_id, "Camera deleted");
    Ok(HttpResponse::NoContent().finish())
}
