//! Object storage shared by the server and the clients.
//!
//! Artifacts are versioned files named `{version}.{ext}` (see [`ArtifactName`]). The server
//! publishes global models, the clients publish local updates, and both download the artifacts of
//! the other side through a [`StorageGateway`] which retries failed transfers.

pub mod artifact;
pub mod backend;
pub mod gateway;
pub mod local;
pub mod retention;
#[cfg(feature = "s3")]
#[cfg_attr(docsrs, doc(cfg(feature = "s3")))]
pub mod s3;


pub use self::{
    artifact::ArtifactName,
    backend::{storage_info, Backend, BackendConnector},
    gateway::{StorageGateway, TransferError},
    local::LocalStore,
};

use derive_more::Display;

use crate::messages::StorageInfo;

/// The error type of the object stores.
pub type StorageError = anyhow::Error;
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
/// The kinds of object stores.
pub enum StorageKind {
    /// A directory tree reachable by every participant.
    #[default]
    #[display(fmt = "local")]
    Local,
    /// An S3 compatible bucket.
    #[display(fmt = "s3")]
    S3,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// An object store holding the model artifacts.
///
/// Keys are `/` separated paths relative to the root of the store.
pub trait ObjectStore: Send + Sync + 'static {
    /// Stores `data` under `key`, replacing any previous object.
    async fn upload(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Fetches the object stored under `key`.
    ///
    /// # Behavior
    ///
    /// Fails if the object does not exist.
    async fn download(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Checks whether an object is stored under `key`.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Lists the keys of the objects directly below `prefix`.
    ///
    /// # Behavior
    ///
    /// Returns an empty list if nothing is stored below `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Opens the object store announced by the server in the handshake.
pub trait StorageConnector: Send + Sync + 'static {
    type Store: ObjectStore;

    fn connect(&self, info: &StorageInfo) -> StorageResult<Self::Store>;
}

/// Joins `/` separated key segments, ignoring empty segments.
pub fn join_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
