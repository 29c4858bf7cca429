//! Publishing public keys.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::error::Error;
use crate::keypair::KeyPair;
use crate::naming::ObjectName;
use crate::store::KeyBucket;

#[derive(Clone)]
pub struct Publisher {
    bucket: Arc<dyn KeyBucket>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

impl Publisher {
    pub fn new(bucket: Arc<dyn KeyBucket>) -> Self {
        Self { bucket }
    }

    /// Upload `key`'s `authorized_keys` line under its derived object name.
    ///
    /// A single attempt; a failed write is returned as [`Error::Publish`]
    /// and left to the caller to retry.
    pub async fn publish(&self, key: &KeyPair) -> Result<ObjectName, Error> {
        let name = ObjectName::for_key(key);
        let body = key.authorized_key()?;
        let object = name.to_string();

        self.bucket
            .put(&object, Bytes::from(body))
            .await
            .map_err(|source| Error::Publish {
                name: object.clone(),
                source,
            })?;

        info!(
            bucket = %self.bucket.name(),
            object = %object,
            expiration = %key.expiration(),
            "published key"
        );
        Ok(name)
    }
}
