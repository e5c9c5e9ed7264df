//! Process-wide registry of camera workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::models::Reading;
use crate::worker::{PipelineContext, WorkerFeed, WorkerHandle};

/// Process-wide map of camera id to its worker. At most one live worker per
/// camera: check-and-spawn happens under a single lock, which is never held
/// across I/O.
pub struct CameraRegistry {
    ctx: PipelineContext,
    runtime: Handle,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
}

impl CameraRegistry {
    /// Workers are spawned on `runtime` regardless of which thread calls in.
    pub fn new(ctx: PipelineContext, runtime: Handle) -> Self {
        Self {
            ctx,
            runtime,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<i64, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a worker for the camera unless a live one exists. A worker that
    /// has terminated is replaced.
    pub fn ensure_running(&self, camera_id: i64, source_uri: &str) -> Arc<WorkerFeed> {
        let mut workers = self.workers();

        if let Some(handle) = workers.get(&camera_id) {
            if handle.is_alive() {
                return handle.feed();
            }
            warn!(camera_id, "Camera worker terminated, restarting");
        }

        self.spawn_into(&mut workers, camera_id, source_uri)
    }

    /// Current feed for an open stream. Like [`ensure_running`](Self::ensure_running)
    /// a terminated worker is replaced, but a camera that was stopped stays
    /// stopped and yields `None`.
    pub fn resume_feed(&self, camera_id: i64, source_uri: &str) -> Option<Arc<WorkerFeed>> {
        let mut workers = self.workers();

        let handle = workers.get(&camera_id)?;
        if handle.is_alive() {
            return Some(handle.feed());
        }
        warn!(camera_id, "Camera worker terminated under an open stream, restarting");

        Some(self.spawn_into(&mut workers, camera_id, source_uri))
    }

    fn spawn_into(
        &self,
        workers: &mut HashMap<i64, WorkerHandle>,
        camera_id: i64,
        source_uri: &str,
    ) -> Arc<WorkerFeed> {
        let handle = WorkerHandle::spawn(
            &self.runtime,
            self.ctx.clone(),
            camera_id,
            source_uri.to_string(),
        );
        let feed = handle.feed();
        workers.insert(camera_id, handle);
        info!(camera_id, "Camera worker spawned for {}", source_uri);
        feed
    }

    /// Ask the camera's worker to stop and forget it. Unknown ids are ignored.
    pub fn stop(&self, camera_id: i64) {
        if let Some(handle) = self.workers().remove(&camera_id) {
            handle.request_stop();
            info!(camera_id, "Camera worker stop requested");
        }
    }

    pub fn stop_all(&self) {
        for (camera_id, handle) in self.workers().drain() {
            handle.request_stop();
            info!(camera_id, "Camera worker stop requested");
        }
    }

    /// Feed of a live worker.
    pub fn feed(&self, camera_id: i64) -> Option<Arc<WorkerFeed>> {
        self.workers()
            .get(&camera_id)
            .filter(|handle| handle.is_alive())
            .map(WorkerHandle::feed)
    }

    pub fn is_running(&self, camera_id: i64) -> bool {
        self.feed(camera_id).is_some()
    }

    /// Latest reading per live camera, `None` for cameras that have not
    /// recognized anything yet.
    pub fn live_readings(&self) -> BTreeMap<i64, Option<Reading>> {
        self.workers()
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(camera_id, handle)| (*camera_id, handle.feed().latest_reading()))
            .collect()
    }
}
