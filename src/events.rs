//! Turns an accepted plate recognition into a parking event.
//!
//! Order of checks: plate grammar, the worker's debounce cache, then the
//! camera role decides between opening and closing a record. The ledger
//! commit is the only fallible step; on failure the debounce entry is
//! dropped so the next sighting retries.

use chrono::{DateTime, Duration, Utc};
use plate_ocr::is_valid_plate;
use tracing::{debug, info, warn};

use crate::debounce::DebounceCache;
use crate::error::Result;
use crate::ledger::{EntryOutcome, ExitOutcome, Ledger};
use crate::models::CameraRole;

/// Why a recognition produced no mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidPlate,
    Debounced,
    RecentEntry,
    NoParkedRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateOutcome {
    Entered { record_id: i64 },
    Exited { record_id: i64 },
    Rejected(Rejection),
}

pub struct PlateEventResolver {
    ledger: Ledger,
    camera_id: i64,
    role: CameraRole,
    debounce: DebounceCache,
    entry_guard: Duration,
}

impl PlateEventResolver {
    pub fn new(
        ledger: Ledger,
        camera_id: i64,
        role: CameraRole,
        debounce_window: Duration,
        entry_guard: Duration,
    ) -> Self {
        Self {
            ledger,
            camera_id,
            role,
            debounce: DebounceCache::new(debounce_window),
            entry_guard,
        }
    }

    pub fn role(&self) -> CameraRole {
        self.role
    }

    pub fn debounce(&self) -> &DebounceCache {
        &self.debounce
    }

    pub async fn resolve(
        &mut self,
        plate: &str,
        plate_type: &str,
        now: DateTime<Utc>,
    ) -> Result<PlateOutcome> {
        if !is_valid_plate(plate) {
            debug!(camera_id = self.camera_id, plate, "Ignoring malformed plate text");
            return Ok(PlateOutcome::Rejected(Rejection::InvalidPlate));
        }

        if self.debounce.is_recent(plate, now) {
            debug!(camera_id = self.camera_id, plate, "Debounced repeat sighting");
            return Ok(PlateOutcome::Rejected(Rejection::Debounced));
        }
        self.debounce.accept(plate, now);

        let committed = match self.role {
            CameraRole::Entrance => self
                .ledger
                .record_entry(plate, plate_type, self.entry_guard, now)
                .await
                .map(|outcome| match outcome {
                    EntryOutcome::Entered { record_id } => PlateOutcome::Entered { record_id },
                    EntryOutcome::RecentEntry { .. } => {
                        PlateOutcome::Rejected(Rejection::RecentEntry)
                    }
                }),
            CameraRole::Exit => self
                .ledger
                .record_exit(plate, now)
                .await
                .map(|outcome| match outcome {
                    ExitOutcome::Exited { record_id } => PlateOutcome::Exited { record_id },
                    ExitOutcome::NoParkedRecord => {
                        PlateOutcome::Rejected(Rejection::NoParkedRecord)
                    }
                }),
        };

        match committed {
            Ok(outcome) => {
                match outcome {
                    PlateOutcome::Entered { record_id } => info!(
                        camera_id = self.camera_id,
                        plate,
                        plate_type,
                        record_id,
                        "Vehicle entered"
                    ),
                    PlateOutcome::Exited { record_id } => {
                        info!(camera_id = self.camera_id, plate, record_id, "Vehicle exited")
                    }
                    PlateOutcome::Rejected(Rejection::NoParkedRecord) => info!(
                        camera_id = self.camera_id,
                        plate,
                        "Exit without a tracked entry, ignored"
                    ),
                    PlateOutcome::Rejected(reason) => {
                        debug!(camera_id = self.camera_id, plate, ?reason, "Sighting dropped")
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(camera_id = self.camera_id, plate, "Ledger commit failed: {}", e);
                self.debounce.forget(plate);
                Err(e)
            }
        }
    }
}
