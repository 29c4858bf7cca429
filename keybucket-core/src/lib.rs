//! Ephemeral SSH keys authorized through an object store.
//!
//! Keys are generated with a fixed lifetime ([`KeyPair`]), published under a
//! name that encodes when they expire ([`naming`]), and read back by
//! [`RetrievalPipeline`] for sshd's `AuthorizedKeysCommand`.
//!
//! ```text
//! genkey:   KeyPair::generate ─► ObjectName ─► Publisher::publish ─► bucket
//! authkeys: bucket ─► RetrievalPipeline::list ─► AuthorizedKeys ─► stdout
//! ```

pub mod config;
pub mod error;
pub mod keypair;
pub mod naming;
pub mod pipeline;
pub mod publish;
pub mod store;

pub use config::Config;
pub use error::{Error, StoreError};
pub use keypair::KeyPair;
pub use naming::{ObjectName, object_name};
pub use pipeline::{AuthorizedKeys, MAX_KEY_OBJECT_SIZE, PipelineStats, RetrievalPipeline};
pub use publish::Publisher;
pub use store::{KeyBucket, ObjectEntry, ObjectStoreBucket};
