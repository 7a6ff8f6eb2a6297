//! The object store selected by the settings.

use anyhow::anyhow;
#[cfg(feature = "s3")]
use rusoto_core::Region;

#[cfg(feature = "s3")]
use super::s3::S3Store;
use super::{join_key, LocalStore, ObjectStore, StorageConnector, StorageKind, StorageResult};
use crate::{messages::StorageInfo, settings::StorageSettings};

/// One of the supported object stores.
#[derive(Clone)]
pub enum Backend {
    Local(LocalStore),
    #[cfg(feature = "s3")]
    #[cfg_attr(docsrs, doc(cfg(feature = "s3")))]
    S3(S3Store),
}

impl Backend {
    /// Opens the object store of the server.
    ///
    /// The bucket of an S3 store is created if it doesn't exist yet.
    pub async fn from_settings(settings: &StorageSettings) -> StorageResult<Self> {
        match settings.backend {
            StorageKind::Local => Ok(Self::Local(LocalStore::new(&settings.root))),
            #[cfg(feature = "s3")]
            StorageKind::S3 => {
                let s3_settings = settings
                    .s3
                    .as_ref()
                    .ok_or_else(|| anyhow!("missing [storage.s3] settings"))?;
                let store = S3Store::new(s3_settings)?;
                store.create_bucket().await?;
                Ok(Self::S3(store))
            }
            #[cfg(not(feature = "s3"))]
            StorageKind::S3 => Err(anyhow!("the s3 backend requires the `s3` feature")),
        }
    }
}

#[async_trait]
impl ObjectStore for Backend {
    async fn upload(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        match self {
            Self::Local(store) => store.upload(key, data).await,
            #[cfg(feature = "s3")]
            Self::S3(store) => store.upload(key, data).await,
        }
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        match self {
            Self::Local(store) => store.download(key).await,
            #[cfg(feature = "s3")]
            Self::S3(store) => store.download(key).await,
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self {
            Self::Local(store) => store.exists(key).await,
            #[cfg(feature = "s3")]
            Self::S3(store) => store.exists(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        match self {
            Self::Local(store) => store.list(prefix).await,
            #[cfg(feature = "s3")]
            Self::S3(store) => store.list(prefix).await,
        }
    }
}

/// Describes the object store of the server to a client.
pub fn storage_info(settings: &StorageSettings, client_id: &str) -> StorageInfo {
    let client_folder = join_key([settings.client_folder.as_str(), client_id]);
    #[cfg(feature = "s3")]
    if let (StorageKind::S3, Some(s3)) = (settings.backend, &settings.s3) {
        let (region, endpoint) = match &s3.region {
            Region::Custom { name, endpoint } => (name.clone(), Some(endpoint.clone())),
            region => (region.name().to_string(), None),
        };
        return StorageInfo {
            kind: StorageKind::S3,
            location: s3.bucket.clone(),
            region: Some(region),
            endpoint,
            access_key: Some(s3.access_key.clone()),
            secret_access_key: Some(s3.secret_access_key.clone()),
            client_folder,
        };
    }
    StorageInfo {
        kind: settings.backend,
        location: settings.root.display().to_string(),
        region: None,
        endpoint: None,
        access_key: None,
        secret_access_key: None,
        client_folder,
    }
}

/// Opens the object store announced by the server with the backends compiled into the crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendConnector;

impl StorageConnector for BackendConnector {
    type Store = Backend;

    fn connect(&self, info: &StorageInfo) -> StorageResult<Backend> {
        match info.kind {
            StorageKind::Local => Ok(Backend::Local(LocalStore::new(&info.location))),
            #[cfg(feature = "s3")]
            StorageKind::S3 => Ok(Backend::S3(S3Store::from_info(info)?)),
            #[cfg(not(feature = "s3"))]
            StorageKind::S3 => Err(anyhow!(
                "the server announced an s3 store but the `s3` feature is disabled"
            )),
        }
    }
}
