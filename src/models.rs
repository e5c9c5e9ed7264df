use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the barrier a camera watches. Read once when its worker
/// starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CameraRole {
    Entrance,
    Exit,
}

impl Default for CameraRole {
    fn default() -> Self {
        CameraRole::Entrance
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraRole::Entrance => write!(f, "entrance"),
            CameraRole::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    pub source_uri: String,
    pub role: CameraRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCamera {
    pub name: String,
    pub source_uri: String,
    #[serde(default)]
    pub role: CameraRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RecordStatus {
    Parked,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParkingRecord {
    pub id: i64,
    pub plate: String,
    pub plate_type: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: RecordStatus,
}

/// Singleton row (id = 1) holding detector thresholds and the slot ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemConfig {
    pub id: i64,
    pub conf_thres: f64,
    pub iou_thres: f64,
    pub retention_days: i64,
    pub total_slots: i64,
    pub available_slots: i64,
    pub updated_at: DateTime<Utc>,
}

/// Dashboard aggregate, produced by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    pub total_slots: i64,
    pub available_slots: i64,
    pub parked: i64,
}

/// Most recent plate recognized by one camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub plate: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub plate_type: String,
}
