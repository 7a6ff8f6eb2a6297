//! Bounded-retry transfers on top of an [`ObjectStore`].

use std::{path::Path, sync::Arc};

use displaydoc::Display;
use thiserror::Error;

use super::{ArtifactName, ObjectStore, StorageError, StorageResult};
use crate::{settings::RetrySettings, utils::retry::with_retry};

/// Errors of a transfer.
#[derive(Debug, Display, Error)]
pub enum TransferError {
    /// Transfer of {key} failed after {attempts} attempts: {error}.
    Exhausted {
        key: String,
        attempts: usize,
        error: StorageError,
    },
    /// Failed to access the local file {path}: {error}.
    Local {
        path: String,
        error: std::io::Error,
    },
}

impl TransferError {
    fn exhausted(key: &str, attempts: usize, error: StorageError) -> Self {
        Self::Exhausted {
            key: key.to_string(),
            attempts,
            error,
        }
    }

    fn local(path: &Path, error: std::io::Error) -> Self {
        Self::Local {
            path: path.display().to_string(),
            error,
        }
    }
}

/// Access to an object store where every transfer is retried with a fixed backoff.
///
/// After the last failed attempt the artifact is considered unavailable and the error is returned
/// to the caller, which skips the artifact for the current round.
pub struct StorageGateway<S> {
    store: Arc<S>,
    retry: RetrySettings,
}

impl<S> Clone for StorageGateway<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry,
        }
    }
}

impl<S> StorageGateway<S>
where
    S: ObjectStore,
{
    pub fn new(store: S, retry: RetrySettings) -> Self {
        Self {
            store: Arc::new(store),
            retry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Checks whether an object exists. A failing check counts as a missing object.
    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!("failed to check the existence of {}: {}", key, err);
                false
            }
        }
    }

    /// Downloads an object.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, TransferError> {
        let store = &self.store;
        let (data, attempts) = with_retry("download", self.retry, move || store.download(key))
            .await
            .map_err(|exhausted| {
                TransferError::exhausted(key, exhausted.attempts, exhausted.error)
            })?;
        debug!(attempts, "downloaded {} ({} bytes)", key, data.len());
        Ok(data)
    }

    /// Downloads an object into a local file, creating the parent directories if needed.
    pub async fn download_to(&self, key: &str, path: &Path) -> Result<(), TransferError> {
        let data = self.download(key).await?;
        write_file(path, &data).await
    }

    /// Uploads an object.
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), TransferError> {
        let store = &self.store;
        let data = &data;
        let ((), attempts) = with_retry("upload", self.retry, move || store.upload(key, data.clone()))
            .await
            .map_err(|exhausted| {
                TransferError::exhausted(key, exhausted.attempts, exhausted.error)
            })?;
        debug!(attempts, "uploaded {} ({} bytes)", key, data.len());
        Ok(())
    }

    /// Uploads a local file.
    pub async fn upload_from(&self, path: &Path, key: &str) -> Result<(), TransferError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|err| TransferError::local(path, err))?;
        self.upload(key, data).await
    }

    /// Finds the newest artifact with the given extension in `folder`.
    pub async fn latest_version(&self, folder: &str, extension: &str) -> StorageResult<Option<u64>> {
        let keys = self.store.list(folder).await?;
        Ok(keys
            .iter()
            .filter_map(|key| ArtifactName::from_key(key, extension))
            .map(|name| name.version)
            .max())
    }
}

/// Writes a file, creating its parent directories if needed.
pub(crate) async fn write_file(path: &Path, data: &[u8]) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| TransferError::local(path, err))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|err| TransferError::local(path, err))
}
