//! The registry of the workers known to the server.

use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::messages::{DataDescription, Role, SystemInfo};

/// The stable identity of a worker, announced by the client.
pub type WorkerId = String;

/// A local update recorded for a worker and not yet aggregated.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    /// The key of the uploaded artifact.
    pub remote_path: String,
    /// The global version the update was trained from.
    pub global_version_used: u64,
    pub loss: f64,
    pub performance: f64,
}

/// A worker known to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub session_id: String,
    pub role: Role,
    pub system_info: SystemInfo,
    pub data_description: DataDescription,
    pub last_heartbeat: Instant,
    pub is_connected: bool,
    /// The newest global version the worker trained from. Never decreases.
    pub current_version: u64,
    /// The unconsumed local update. `Some` iff the worker is completed.
    pub update: Option<LocalUpdate>,
    // bumped on every recorded update, so that a snapshot only clears what it saw
    update_seq: u64,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<WorkerId>,
        session_id: impl Into<String>,
        role: Role,
        system_info: SystemInfo,
        data_description: DataDescription,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            session_id: session_id.into(),
            role,
            system_info,
            data_description,
            last_heartbeat: Instant::now(),
            is_connected: true,
            current_version: 0,
            update: None,
            update_seq: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.update.is_some()
    }

    pub fn weight_artifact_path(&self) -> Option<&str> {
        self.update.as_ref().map(|update| update.remote_path.as_str())
    }

    pub fn loss(&self) -> Option<f64> {
        self.update.as_ref().map(|update| update.loss)
    }
}

/// The outcome of [`WorkerRegistry::add_worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Updated,
}

/// The workers known to the server.
///
/// Workers are created on their first handshake and never deleted. Every method serializes its
/// access internally, so the registry can be shared between the message handlers and the
/// aggregation loop.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<WorkerId, Worker>>,
    liveness_window: Duration,
}

impl WorkerRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            liveness_window,
        }
    }

    /// Inserts a worker, or refreshes the connection details of a known one.
    ///
    /// The version and the unconsumed update of a known worker are kept.
    pub async fn add_worker(&self, worker: Worker) -> Registration {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(&worker.worker_id) {
            Some(known) => {
                known.session_id = worker.session_id;
                known.role = worker.role;
                known.system_info = worker.system_info;
                known.data_description = worker.data_description;
                known.last_heartbeat = Instant::now();
                known.is_connected = true;
                Registration::Updated
            }
            None => {
                debug!(worker_id = %worker.worker_id, "new worker");
                workers.insert(worker.worker_id.clone(), worker);
                Registration::New
            }
        }
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.lock().await.get(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<Worker> {
        self.workers.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Records a local update and marks the worker as completed.
    ///
    /// A newer update of the same worker replaces an unconsumed one. Returns `false` if the
    /// worker is unknown.
    pub async fn record_local_update(&self, worker_id: &str, update: LocalUpdate) -> bool {
        let mut workers = self.workers.lock().await;
        let worker = match workers.get_mut(worker_id) {
            Some(worker) => worker,
            None => {
                warn!(worker_id, "discarding local update of unknown worker");
                return false;
            }
        };
        if update.global_version_used < worker.current_version {
            debug!(
                worker_id,
                "local update trained from version {} while version {} was already reported",
                update.global_version_used,
                worker.current_version
            );
        }
        worker.current_version = worker.current_version.max(update.global_version_used);
        worker.last_heartbeat = Instant::now();
        worker.is_connected = true;
        worker.update = Some(update);
        worker.update_seq += 1;
        true
    }

    /// A point-in-time snapshot of the completed workers.
    pub async fn completed_workers(&self) -> Vec<Worker> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|worker| worker.is_completed())
            .cloned()
            .collect()
    }

    /// Consumes the updates of a snapshot taken with [`completed_workers`].
    ///
    /// An update recorded after the snapshot is left untouched for the next pass. Returns the
    /// number of consumed updates.
    ///
    /// [`completed_workers`]: WorkerRegistry::completed_workers
    pub async fn clear_completed(&self, snapshot: &[Worker]) -> usize {
        let mut workers = self.workers.lock().await;
        let mut cleared = 0;
        for seen in snapshot {
            if let Some(worker) = workers.get_mut(&seen.worker_id) {
                if worker.update_seq == seen.update_seq && worker.update.is_some() {
                    worker.update = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Marks a worker as alive. Returns `false` if the worker is unknown.
    pub async fn touch_heartbeat(&self, worker_id: &str) -> bool {
        match self.workers.lock().await.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Instant::now();
                worker.is_connected = true;
                true
            }
            None => false,
        }
    }

    /// Recomputes which workers are connected. Returns the number of connected workers.
    pub async fn refresh_liveness(&self) -> usize {
        let now = Instant::now();
        let mut workers = self.workers.lock().await;
        let mut connected = 0;
        for worker in workers.values_mut() {
            let is_connected = now.duration_since(worker.last_heartbeat) <= self.liveness_window;
            if worker.is_connected && !is_connected {
                info!(worker_id = %worker.worker_id, "worker disconnected");
            }
            worker.is_connected = is_connected;
            connected += is_connected as usize;
        }
        connected
    }
}
