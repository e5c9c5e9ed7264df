//! Persisted parking records and slot counter.
//!
//! Every record mutation and its slot adjustment commit in one transaction.
//! `available_slots` is clamped to `[0, total_slots]` on each change and can
//! be recomputed from the parked count at any time with [`Ledger::reconcile`].

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use crate::config::{DatabaseSettings, LedgerSettings};
use crate::error::{Error, Result};
use crate::models::{Camera, NewCamera, ParkingRecord, SlotSummary, SystemConfig};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS camera (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        source_uri TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'entrance' CHECK (role IN ('entrance', 'exit')),
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parking_record (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        plate TEXT NOT NULL,
        plate_type TEXT NOT NULL,
        entry_time TEXT NOT NULL,
        exit_time TEXT,
        status TEXT NOT NULL DEFAULT 'parked' CHECK (status IN ('parked', 'exited'))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_parking_record_plate_status
        ON parking_record (plate, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        conf_thres REAL NOT NULL DEFAULT 0.5,
        iou_thres REAL NOT NULL DEFAULT 0.45,
        retention_days INTEGER NOT NULL DEFAULT 30,
        total_slots INTEGER NOT NULL DEFAULT 100,
        available_slots INTEGER NOT NULL DEFAULT 100,
        updated_at TEXT NOT NULL
    )
    "#,
];

const RECORD_COLUMNS: &str = "id, plate, plate_type, entry_time, exit_time, status";

/// Result of an entrance commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Entered { record_id: i64 },
    /// The plate's latest record entered within the guard window.
    RecentEntry { record_id: i64 },
}

/// Result of an exit commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited { record_id: i64 },
    /// No parked record for the plate; nothing was changed.
    NoParkedRecord,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and create the schema.
    pub async fn connect(config: &DatabaseSettings) -> Result<Self> {
        info!("Connecting to database at {}", config.url);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(StdDuration::from_secs(5))
            .connect(&config.url)
            .await?;

        let ledger = Self::new(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Private in-memory database, mainly for tests and dry runs.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let ledger = Self::new(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Database schema ready");
        Ok(())
    }

    /// Insert the system configuration row unless it already exists.
    pub async fn seed_system_config(
        &self,
        defaults: &LedgerSettings,
        now: DateTime<Utc>,
    ) -> Result<SystemConfig> {
        let total = defaults.total_slots.max(0);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO system_config
                (id, conf_thres, iou_thres, retention_days,
                 total_slots, available_slots, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(defaults.conf_thres as f64)
        .bind(defaults.iou_thres as f64)
        .bind(defaults.retention_days)
        .bind(total)
        .bind(total)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.system_config().await
    }

    pub async fn system_config(&self) -> Result<SystemConfig> {
        sqlx::query_as::<_, SystemConfig>(
            r#"
            SELECT id, conf_thres, iou_thres, retention_days,
                   total_slots, available_slots, updated_at
            FROM system_config
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound("system configuration".into()))
    }

    /// List all cameras
    pub async fn list_cameras(&self) -> Result<Vec<Camera>> {
        let cameras = sqlx::query_as::<_, Camera>(
            "SELECT id, name, source_uri, role, created_at FROM camera ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(cameras)
    }

    /// Get camera by ID
    pub async fn get_camera(&self, id: i64) -> Result<Option<Camera>> {
        let camera = sqlx::query_as::<_, Camera>(
            "SELECT id, name, source_uri, role, created_at FROM camera WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(camera)
    }

    /// Create a new camera
    pub async fn create_camera(&self, camera: &NewCamera, now: DateTime<Utc>) -> Result<Camera> {
        info!("Creating new camera: {}", camera.name);

        let created = sqlx::query_as::<_, Camera>(
            r#"
            INSERT INTO camera (name, source_uri, role, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, name, source_uri, role, created_at
            "#,
        )
        .bind(&camera.name)
        .bind(&camera.source_uri)
        .bind(camera.role)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    /// Delete camera, returning whether a row existed
    pub async fn delete_camera(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM camera WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recently inserted record for `plate`, any status.
    pub async fn latest_record(&self, plate: &str) -> Result<Option<ParkingRecord>> {
        let record = sqlx::query_as::<_, ParkingRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM parking_record WHERE plate = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(plate)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Most recent records, newest first.
    pub async fn recent_records(&self, limit: i64) -> Result<Vec<ParkingRecord>> {
        let records = sqlx::query_as::<_, ParkingRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM parking_record ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Open a parked record for `plate` and take one slot, unless the plate's
    /// latest record entered less than `guard` ago.
    pub async fn record_entry(
        &self,
        plate: &str,
        plate_type: &str,
        guard: Duration,
        now: DateTime<Utc>,
    ) -> Result<EntryOutcome> {
        let mut tx = self.pool.begin().await?;

        let latest = sqlx::query_as::<_, ParkingRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM parking_record WHERE plate = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(plate)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(record) = latest {
            if now - record.entry_time < guard {
                tx.rollback().await?;
                return Ok(EntryOutcome::RecentEntry {
                    record_id: record.id,
                });
            }
        }

        let record_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO parking_record (plate, plate_type, entry_time, exit_time, status)
            VALUES (?, ?, ?, NULL, 'parked')
            RETURNING id
            "#,
        )
        .bind(plate)
        .bind(plate_type)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE system_config
            SET available_slots = MAX(available_slots - 1, 0), updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EntryOutcome::Entered { record_id })
    }

    /// Close the plate's latest parked record and release one slot.
    pub async fn record_exit(&self, plate: &str, now: DateTime<Utc>) -> Result<ExitOutcome> {
        let mut tx = self.pool.begin().await?;

        let parked = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM parking_record
            WHERE plate = ? AND status = 'parked'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(plate)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record_id) = parked else {
            tx.rollback().await?;
            return Ok(ExitOutcome::NoParkedRecord);
        };

        sqlx::query("UPDATE parking_record SET exit_time = ?, status = 'exited' WHERE id = ?")
            .bind(now)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE system_config
            SET available_slots = MIN(available_slots + 1, total_slots), updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ExitOutcome::Exited { record_id })
    }

    /// Recompute `available_slots` as `total_slots - parked` (floored at 0)
    /// and persist it, overriding the incremental counter.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SlotSummary> {
        let mut tx = self.pool.begin().await?;

        let parked = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM parking_record WHERE status = 'parked'",
        )
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE system_config
            SET available_slots = MAX(total_slots - ?, 0), updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(parked)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (total_slots, available_slots) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT total_slots, available_slots FROM system_config WHERE id = 1",
        )
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound("system configuration".into()))?;

        tx.commit().await?;
        Ok(SlotSummary {
            total_slots,
            available_slots,
            parked,
        })
    }

    /// Delete exited records whose exit time is before `cutoff`. Parked
    /// records are kept regardless of age.
    pub async fn purge_exited_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM parking_record
            WHERE status = 'exited' AND julianday(exit_time) < julianday(?)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
