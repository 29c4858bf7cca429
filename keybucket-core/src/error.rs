//! Error types for key generation, publishing and retrieval.

/// Failure reported by a [`KeyBucket`](crate::store::KeyBucket) implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("invalid object body: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            other => Self::Other(anyhow::Error::new(other)),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Key material could not be created; no partial key pair exists.
    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("key encoding failed: {0}")]
    Encoding(String),

    /// The store rejected the upload.  Not retried.
    #[error("failed to publish {name}: {source}")]
    Publish {
        name: String,
        #[source]
        source: StoreError,
    },

    /// Discovery failed, so nothing can be served.
    #[error("failed to list key objects: {0}")]
    List(#[source] StoreError),

    /// A single object could not be fetched.  The pipeline drops the entry
    /// and keeps going.
    #[error("failed to download {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}
