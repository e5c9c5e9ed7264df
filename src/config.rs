use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Environment variable naming the configuration file (without extension).
pub const CONFIG_PATH_VAR: &str = "PARKING_SENTRY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "parking_sentry";
const ENV_PREFIX: &str = "PARKING_SENTRY";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub pipeline: PipelineSettings,
    pub detector: DetectorSettings,
    pub ocr: OcrSettings,
    pub ledger: LedgerSettings,
    pub streaming: StreamingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP bind address
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

/// Per-camera loop tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Run the detector on every Nth frame
    pub sample_interval: u64,
    /// Margin in pixels added around a detection before cropping
    pub crop_padding: u32,
    /// In-memory duplicate suppression window
    pub debounce_secs: i64,
    /// Minimum age of the latest entry before the same plate may enter again
    pub entry_guard_secs: i64,
    pub reconnect_backoff_ms: u64,
    pub loop_delay_ms: u64,
    pub jpeg_quality: u8,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// ONNX model; without it detection is disabled
    pub model_path: Option<PathBuf>,
    /// Class names in model output order
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Base URL of the OCR server
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub probe_interval_secs: u64,
    /// Directory shared with the OCR server for staged crops
    pub scratch_dir: Option<PathBuf>,
    /// Use in-process Tesseract with this language instead of the server
    pub tesseract_language: Option<String>,
}

/// Seed values for the system configuration row
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub total_slots: i64,
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub retention_days: i64,
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub frame_interval_ms: u64,
    pub placeholder_interval_ms: u64,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            pipeline: PipelineSettings::default(),
            detector: DetectorSettings::default(),
            ocr: OcrSettings::default(),
            ledger: LedgerSettings::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://parking_sentry.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sample_interval: 5,
            crop_padding: 5,
            debounce_secs: 30,
            entry_guard_secs: 30,
            reconnect_backoff_ms: 2000,
            loop_delay_ms: 10,
            jpeg_quality: 80,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            labels: vec!["blue".into(), "green".into(), "yellow".into()],
        }
    }
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            endpoint: Some("http://127.0.0.1:5001".to_string()),
            timeout_ms: 3000,
            probe_interval_secs: 5,
            scratch_dir: None,
            tesseract_language: None,
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            total_slots: 100,
            conf_thres: 0.5,
            iou_thres: 0.45,
            retention_days: 30,
            purge_interval_secs: 3600,
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: 40,
            placeholder_interval_ms: 1000,
            placeholder_width: 640,
            placeholder_height: 360,
        }
    }
}

impl OcrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Loads `$PARKING_SENTRY_CONFIG` (default `parking_sentry.{toml,json,...}`)
    /// with `PARKING_SENTRY__SECTION__KEY` environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("/nonexistent/parking_sentry_test").unwrap();
        assert_eq!(settings.pipeline.sample_interval, 5);
        assert_eq!(settings.pipeline.debounce_secs, 30);
        assert_eq!(settings.ledger.total_slots, 100);
        assert_eq!(settings.streaming.frame_interval_ms, 40);
    }

    #[test]
    fn test_file_overrides_selected_keys() {
        let dir = std::env::temp_dir().join(format!("parking_sentry_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(
            &path,
            "log_level = \"debug\"\n[pipeline]\nsample_interval = 3\n[ledger]\ntotal_slots = 250\n",
        )
        .unwrap();

        let settings = Settings::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.pipeline.sample_interval, 3);
        assert_eq!(settings.pipeline.crop_padding, 5);
        assert_eq!(settings.ledger.total_slots, 250);

        std::fs::remove_dir_all(&dir).ok();
    }
}
