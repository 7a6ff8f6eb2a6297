//! An S3 [`ObjectStore`] backend.

use displaydoc::Display;
use rusoto_core::{
    credential::StaticProvider,
    region::ParseRegionError,
    request::TlsError,
    HttpClient,
    Region,
    RusotoError,
};
use rusoto_s3::{
    CreateBucketError,
    CreateBucketRequest,
    GetObjectError,
    GetObjectOutput,
    GetObjectRequest,
    HeadObjectError,
    HeadObjectRequest,
    ListObjectsV2Error,
    ListObjectsV2Request,
    PutObjectError,
    PutObjectRequest,
    S3Client,
    StreamingBody,
    S3,
};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use super::{join_key, ObjectStore, StorageResult};
use crate::{messages::StorageInfo, settings::S3Settings};

type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Display, Error)]
pub enum ClientError {
    /// Failed to create bucket: {0}.
    CreateBucket(#[from] RusotoError<CreateBucketError>),
    /// Failed to get object: {0}.
    GetObject(#[from] RusotoError<GetObjectError>),
    /// Failed to put object: {0}.
    PutObject(#[from] RusotoError<PutObjectError>),
    /// Failed to check object: {0}.
    HeadObject(#[from] RusotoError<HeadObjectError>),
    /// Failed to list objects: {0}.
    ListObjects(#[from] RusotoError<ListObjectsV2Error>),
    /// Failed to dispatch: {0}.
    Dispatcher(#[from] TlsError),
    /// Invalid region: {0}.
    Region(#[from] ParseRegionError),
    /// The storage info lacks the {0}.
    MissingInfo(&'static str),
    /// Response contains no body.
    NoBody,
    /// Failed to download body: {0}.
    DownloadBody(std::io::Error),
}

/// A bucket used as object store.
#[derive(Clone)]
pub struct S3Store {
    bucket: String,
    client: S3Client,
}

impl S3Store {
    /// Creates a new S3 store from the server settings.
    ///
    /// To connect to AWS-compatible services such as Minio, you need to specify a custom region.
    pub fn new(settings: &S3Settings) -> ClientResult<Self> {
        Self::with_credentials(
            settings.access_key.clone(),
            settings.secret_access_key.clone(),
            settings.region.clone(),
            settings.bucket.clone(),
        )
    }

    /// Creates a new S3 store from the storage info announced by the server.
    pub fn from_info(info: &StorageInfo) -> ClientResult<Self> {
        let region = match (&info.region, &info.endpoint) {
            (Some(name), Some(endpoint)) => Region::Custom {
                name: name.clone(),
                endpoint: endpoint.clone(),
            },
            (Some(name), None) => name.parse()?,
            (None, _) => return Err(ClientError::MissingInfo("region")),
        };
        let access_key = info
            .access_key
            .clone()
            .ok_or(ClientError::MissingInfo("access key"))?;
        let secret_access_key = info
            .secret_access_key
            .clone()
            .ok_or(ClientError::MissingInfo("secret access key"))?;
        Self::with_credentials(access_key, secret_access_key, region, info.location.clone())
    }

    fn with_credentials(
        access_key: String,
        secret_access_key: String,
        region: Region,
        bucket: String,
    ) -> ClientResult<Self> {
        let credentials_provider = StaticProvider::new_minimal(access_key, secret_access_key);
        let dispatcher = HttpClient::new()?;
        Ok(Self {
            bucket,
            client: S3Client::new_with(dispatcher, credentials_provider, region),
        })
    }

    /// Creates the bucket.
    /// This method does not fail if the bucket already exists or is already owned by you.
    pub async fn create_bucket(&self) -> ClientResult<()> {
        debug!("create {} bucket", &self.bucket);
        let req = CreateBucketRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        match self.client.create_bucket(req).await {
            Ok(_)
            | Err(RusotoError::Service(CreateBucketError::BucketAlreadyExists(_)))
            | Err(RusotoError::Service(CreateBucketError::BucketAlreadyOwnedByYou(_))) => Ok(()),
            Err(err) => Err(ClientError::from(err)),
        }
    }

    // Downloads the content of the given object.
    async fn download_object_body(object: GetObjectOutput) -> ClientResult<Vec<u8>> {
        let mut body = Vec::new();
        object
            .body
            .ok_or(ClientError::NoBody)?
            .into_async_read()
            .read_to_end(&mut body)
            .await
            .map_err(ClientError::DownloadBody)?;
        Ok(body)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let req = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            body: Some(StreamingBody::from(data)),
            ..Default::default()
        };
        self.client
            .put_object(req)
            .await
            .map_err(ClientError::from)?;
        Ok(())
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        let req = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };
        let object = self
            .client
            .get_object(req)
            .await
            .map_err(ClientError::from)?;
        Ok(Self::download_object_body(object).await?)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let req = HeadObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };
        match self.client.head_object(req).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(HeadObjectError::NoSuchKey(_))) => Ok(false),
            // rusoto doesn't return NoSuchKey for HEAD requests, which carry no body
            Err(RusotoError::Unknown(resp)) if resp.status.as_u16() == 404 => Ok(false),
            Err(err) => Err(ClientError::from(err).into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{}/", join_key([prefix]));
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let req = ListObjectsV2Request {
                bucket: self.bucket.clone(),
                prefix: Some(prefix.clone()),
                delimiter: Some(String::from("/")),
                continuation_token,
                ..Default::default()
            };
            let output = self
                .client
                .list_objects_v2(req)
                .await
                .map_err(ClientError::from)?;
            keys.extend(
                output
                    .contents
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|object| object.key),
            );
            match output.next_continuation_token {
                Some(token) if output.is_truncated.unwrap_or(false) => {
                    continuation_token = Some(token)
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}
