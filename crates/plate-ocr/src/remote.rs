//! Client for the out-of-process OCR server.
//!
//! The server reads images from a filesystem it shares with us. `POST /ocr`
//! takes `{"path": "..."}` and answers
//! `{"success": true, "data": {"text": "...", "conf": 0.93}}`, with `data`
//! null when nothing readable was found. It answers 503 until its model is
//! loaded and 400 to a request without a path; the readiness probe relies on
//! exactly that difference.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{clean_text, OcrError, PlateText, Recognizer};

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    success: bool,
    data: Option<OcrData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcrData {
    text: String,
    #[serde(default)]
    conf: f32,
}

pub struct RemoteRecognizer {
    client: reqwest::Client,
    endpoint: String,
    scratch_dir: PathBuf,
    sequence: AtomicU64,
    ready: AtomicBool,
}

impl RemoteRecognizer {
    /// Every request, including the readiness probe, is bounded by `timeout`.
    /// Crops are staged under the system temp directory unless
    /// [`with_scratch_dir`](Self::with_scratch_dir) says otherwise.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, OcrError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OcrError::InitError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            scratch_dir: std::env::temp_dir().join("parking_sentry_ocr"),
            sequence: AtomicU64::new(0),
            ready: AtomicBool::new(false),
        })
    }

    /// Directory the server can read crops from.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    fn ocr_url(&self) -> String {
        format!("{}/ocr", self.endpoint)
    }

    /// Sends a request without a path. A loaded model rejects it (400), an
    /// unloaded one answers 503. Anything but 503 or a transport error
    /// counts as ready.
    pub async fn probe(&self) -> bool {
        let ready = match self
            .client
            .post(self.ocr_url())
            .json(&OcrRequest { path: "" })
            .send()
            .await
        {
            Ok(response) => response.status() != StatusCode::SERVICE_UNAVAILABLE,
            Err(e) => {
                debug!("OCR readiness probe failed: {}", e);
                false
            }
        };

        let was_ready = self.ready.swap(ready, Ordering::SeqCst);
        if ready && !was_ready {
            info!("OCR server at {} is ready", self.endpoint);
        } else if !ready && was_ready {
            warn!("OCR server at {} is no longer ready", self.endpoint);
        }
        ready
    }

    /// Probes readiness every `every` until the recognizer is dropped.
    pub fn spawn_readiness_probe(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(recognizer) = weak.upgrade() else {
                    break;
                };
                recognizer.probe().await;
            }
        })
    }

    fn encode_jpeg(crop: &DynamicImage) -> Result<Vec<u8>, OcrError> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(crop.to_rgb8())
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(90))
            .map_err(|e| OcrError::ImageProcessError(e.to_string()))?;
        Ok(bytes)
    }

    async fn stage_crop(&self, crop: &DynamicImage) -> Result<PathBuf, OcrError> {
        let bytes = Self::encode_jpeg(crop)?;
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| OcrError::ImageProcessError(e.to_string()))?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self
            .scratch_dir
            .join(format!("crop_{}_{}.jpg", std::process::id(), sequence));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| OcrError::ImageProcessError(e.to_string()))?;
        Ok(path)
    }

    async fn request(&self, path: &Path) -> Result<Option<PlateText>, OcrError> {
        let path = path.to_string_lossy();
        let response = self
            .client
            .post(self.ocr_url())
            .json(&OcrRequest { path: &path })
            .send()
            .await
            .map_err(|e| OcrError::ApiError(e.to_string()))?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            self.ready.store(false, Ordering::SeqCst);
            return Err(OcrError::NotReady);
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            return Err(OcrError::ApiError(format!(
                "OCR server returned {}: {}",
                status, error_text
            )));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| OcrError::ApiError(e.to_string()))?;

        if !parsed.success {
            return Err(OcrError::ProcessingError(
                parsed.error.unwrap_or_else(|| "unknown OCR failure".into()),
            ));
        }

        Ok(parsed.data.and_then(|data| {
            clean_text(&data.text).map(|text| PlateText {
                text,
                confidence: data.conf,
            })
        }))
    }
}

#[async_trait]
impl Recognizer for RemoteRecognizer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn recognize(&self, crop: &DynamicImage) -> Result<Option<PlateText>, OcrError> {
        let path = self.stage_crop(crop).await?;
        let result = self.request(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove staged crop {}: {}", path.display(), e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const CROP_PATH: &str = r#""path":"[^"]+\.jpg""#;
    const EMPTY_PATH: &str = r#""path":"""#;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("plate_ocr_{}_{}", name, std::process::id()))
    }

    fn recognizer(url: &str, name: &str) -> RemoteRecognizer {
        RemoteRecognizer::new(url, Duration::from_secs(3))
            .unwrap()
            .with_scratch_dir(scratch_dir(name))
    }

    #[tokio::test]
    async fn test_probe_ready_when_server_rejects_missing_path() {
        let mut server = mockito::Server::new_async().await;
        let ocr_route = server
            .mock("POST", "/ocr")
            .match_body(Matcher::Regex(EMPTY_PATH.into()))
            .with_status(400)
            .with_body(r#"{"error": "Path required"}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "probe_ready");
        assert!(!ocr.is_ready());
        assert!(ocr.probe().await);
        assert!(ocr.is_ready());
        ocr_route.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_not_ready_while_model_loads() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ocr")
            .with_status(503)
            .with_body(r#"{"error": "Model not ready"}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "probe_loading");
        assert!(!ocr.probe().await);
        assert!(!ocr.is_ready());
    }

    #[tokio::test]
    async fn test_probe_not_ready_without_server() {
        let ocr = recognizer("http://127.0.0.1:9", "probe_offline");
        assert!(!ocr.probe().await);
    }

    #[tokio::test]
    async fn test_recognize_sends_staged_path_and_cleans_text() {
        let mut server = mockito::Server::new_async().await;
        let ocr_route = server
            .mock("POST", "/ocr")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Regex(CROP_PATH.into()))
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"text": "京A·12345", "conf": 0.93}}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "recognize");
        let result = ocr.recognize(&DynamicImage::new_rgb8(32, 16)).await.unwrap();
        assert_eq!(
            result,
            Some(PlateText {
                text: "京A12345".into(),
                confidence: 0.93
            })
        );
        ocr_route.assert_async().await;

        let leftovers = std::fs::read_dir(scratch_dir("recognize")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_recognize_empty_data_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ocr")
            .with_status(200)
            .with_body(r#"{"success": true, "data": null}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "empty");
        let result = tokio_test::assert_ok!(ocr.recognize(&DynamicImage::new_rgb8(8, 8)).await);
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ocr")
            .with_status(404)
            .with_body(r#"{"error": "File not found"}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "not_found");
        let result = ocr.recognize(&DynamicImage::new_rgb8(8, 8)).await;
        assert!(matches!(result, Err(OcrError::ApiError(_))));
    }

    #[tokio::test]
    async fn test_unavailable_server_clears_readiness() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ocr")
            .match_body(Matcher::Regex(EMPTY_PATH.into()))
            .with_status(400)
            .create_async()
            .await;
        server
            .mock("POST", "/ocr")
            .match_body(Matcher::Regex(CROP_PATH.into()))
            .with_status(503)
            .with_body(r#"{"error": "Model not ready"}"#)
            .create_async()
            .await;

        let ocr = recognizer(&server.url(), "unavailable");
        ocr.probe().await;
        assert!(ocr.is_ready());
        let result = ocr.recognize(&DynamicImage::new_rgb8(8, 8)).await;
        assert!(matches!(result, Err(OcrError::NotReady)));
        assert!(!ocr.is_ready());
    }
}
