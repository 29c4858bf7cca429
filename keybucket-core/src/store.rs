//! Object store access.
//!
//! [`KeyBucket`] is the narrow capability the rest of the crate needs from a
//! bucket: list everything, fetch one object, write one object.
//! [`ObjectStoreBucket`] implements it on top of the `object_store` crate
//! (S3 in production, `InMemory` in tests).

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt as _;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Error, StoreError};

/// One object discovered by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

#[async_trait::async_trait]
pub trait KeyBucket: Send + Sync {
    /// Bucket name, for logging.
    fn name(&self) -> &str;

    /// List every object in the bucket.
    ///
    /// Implementations follow continuation tokens themselves; a failure on
    /// any page fails the whole listing.
    async fn list(&self) -> Result<Vec<ObjectEntry>, StoreError>;

    async fn get(&self, name: &str) -> Result<Bytes, StoreError>;

    async fn put(&self, name: &str, body: Bytes) -> Result<(), StoreError>;
}

/// A [`KeyBucket`] backed by any [`ObjectStore`].
pub struct ObjectStoreBucket {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ObjectStoreBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBucket")
            .field("name", &self.name)
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl ObjectStoreBucket {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// Connect to an S3 (or S3-compatible) bucket.
    ///
    /// Credentials come from the usual `AWS_*` environment variables; the
    /// bucket, region and endpoint come from `config`.
    pub fn s3(config: &StoreConfig) -> Result<Self, Error> {
        let bucket = config.bucket_name()?;
        let region = config.region_name()?;
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| Error::Config(format!("S3 bucket {bucket}: {e}")))?;

        debug!(bucket, region, "connected to S3 bucket");
        Ok(Self::new(bucket, Arc::new(store)))
    }

    /// An empty in-process bucket.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(InMemory::new()))
    }
}

#[async_trait::async_trait]
impl KeyBucket for ObjectStoreBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>, StoreError> {
        let entries: Vec<ObjectEntry> = self
            .store
            .list(None)
            .map_ok(|meta| ObjectEntry {
                name: meta.location.to_string(),
                size: meta.size,
            })
            .try_collect()
            .await?;
        debug!(bucket = %self.name, count = entries.len(), "listed objects");
        Ok(entries)
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        let result = self.store.get(&object_path(name)?).await?;
        Ok(result.bytes().await?)
    }

    async fn put(&self, name: &str, body: Bytes) -> Result<(), StoreError> {
        self.store
            .put(&object_path(name)?, PutPayload::from(body))
            .await?;
        Ok(())
    }
}

/// Names handed out by `list` are already in the store's encoded form and
/// must not be encoded a second time.
fn object_path(name: &str) -> Result<Path, StoreError> {
    Path::parse(name).map_err(|e| StoreError::Invalid(format!("object name {name:?}: {e}")))
}
