//! The local update waiting for publication.

use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::model::Weights;

/// The result of local training, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModelUpdateInfo {
    pub weights: Weights,
    /// `{local_epoch}.{ext}`.
    pub file_name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// The global version training started from.
    pub global_version_used: u64,
    /// The local epoch which produced the update.
    pub local_epoch: u64,
    pub train_accuracy: f64,
    pub train_loss: f64,
    pub has_unpublished: bool,
}

#[derive(Debug, Default)]
struct Slot {
    update: Option<LocalModelUpdateInfo>,
    generation: u64,
}

/// The single pending local update of a client.
///
/// Training overwrites it, the publish loop takes snapshots of it. A snapshot is committed only if
/// no newer update was written meanwhile, so a fresher result is never marked as published.
///
/// The slot is shared with the blocking training thread, hence the synchronous lock. It is never
/// held across an `.await`.
#[derive(Debug, Default)]
pub struct PendingUpdate {
    slot: Mutex<Slot>,
}

impl PendingUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the pending update and marks it as unpublished.
    pub fn put(&self, mut update: LocalModelUpdateInfo) {
        update.has_unpublished = true;
        let mut slot = self.lock();
        slot.generation += 1;
        slot.update = Some(update);
    }

    /// Copies the pending update if it is not yet published, along with its generation.
    pub fn snapshot(&self) -> Option<(u64, LocalModelUpdateInfo)> {
        let slot = self.lock();
        slot.update
            .as_ref()
            .filter(|update| update.has_unpublished)
            .map(|update| (slot.generation, update.clone()))
    }

    /// Marks the update of `generation` as published.
    ///
    /// Returns `false` if a newer update replaced it since the snapshot.
    pub fn commit(&self, generation: u64) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        if let Some(update) = slot.update.as_mut() {
            update.has_unpublished = false;
        }
        true
    }

    pub fn has_unpublished(&self) -> bool {
        self.lock()
            .update
            .as_ref()
            .map_or(false, |update| update.has_unpublished)
    }

    /// A copy of the last update, published or not.
    pub fn latest(&self) -> Option<LocalModelUpdateInfo> {
        self.lock().update.clone()
    }
}
