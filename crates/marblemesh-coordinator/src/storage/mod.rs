//! Storage abstraction for the coordinator
//!
//! The store is a transactional typed KV holding everything the
//! coordinator persists: CA material, the committed manifest and its
//! update overlay, materialised shared secrets and per-type activation
//! counters. Sealed persistent backends live behind this trait; the
//! in-memory backend is the default for tests and single-instance
//! development runs.
//!
//! Persisted layout (encoding is backend-defined):
//!
//! - `cert/root`, `cert/intermediate` - DER certificates
//! - `privk/root`, `privk/intermediate` - PKCS#8 private keys
//! - `manifest/main`, `manifest/update` - policy documents
//! - `secrets/<name>` - materialised shared secrets
//! - `activations/<marbleType>` - unsigned counters
//!
//! Store operations must be serialisable with respect to a single
//! activation; the coordinator guarantees this by holding its activation
//! lock across every call.

pub mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use marblemesh_core::{Certificate, Manifest, PrivateKey, Secret};
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The requested value was never written
    #[error("requested value not set: {0}")]
    NotSet(String),

    /// The backend failed
    #[error("storage failure: {0}")]
    Internal(String),

    /// A stored value could not be decoded
    #[error("stored value corrupt: {0}")]
    Corrupt(String),
}

/// Typed KV store backing the coordinator
///
/// Implementations must be thread-safe; individual operations must be
/// atomic, `increment_activations` in particular.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a CA certificate (`"root"` or `"intermediate"`)
    async fn get_certificate(&self, name: &str) -> Result<Certificate, StoreError>;

    /// Write a CA certificate
    async fn put_certificate(&self, name: &str, cert: &Certificate) -> Result<(), StoreError>;

    /// Read a CA private key (`"root"` or `"intermediate"`)
    async fn get_private_key(&self, name: &str) -> Result<PrivateKey, StoreError>;

    /// Write a CA private key
    async fn put_private_key(&self, name: &str, key: &PrivateKey) -> Result<(), StoreError>;

    /// Read a manifest (`"main"` or `"update"`)
    async fn get_manifest(&self, name: &str) -> Result<Manifest, StoreError>;

    /// Write a manifest
    async fn put_manifest(&self, name: &str, manifest: &Manifest) -> Result<(), StoreError>;

    /// All materialised shared secrets
    async fn get_secret_map(&self) -> Result<BTreeMap<String, Secret>, StoreError>;

    /// Persist one materialised shared secret
    async fn put_secret(&self, name: &str, secret: &Secret) -> Result<(), StoreError>;

    /// Activation counter of a marble type; `NotSet` if the type never
    /// activated
    async fn get_activations(&self, marble_type: &str) -> Result<u64, StoreError>;

    /// Seed or overwrite an activation counter
    async fn put_activations(&self, marble_type: &str, count: u64) -> Result<(), StoreError>;

    /// Atomically add one to an activation counter, returning the new
    /// value
    async fn increment_activations(&self, marble_type: &str) -> Result<u64, StoreError>;

    /// The update overlay, or an empty manifest when none was committed
    async fn get_update_manifest(&self) -> Result<Manifest, StoreError> {
        match self.get_manifest("update").await {
            Ok(manifest) => Ok(manifest),
            Err(StoreError::NotSet(_)) => Ok(Manifest::default()),
            Err(err) => Err(err),
        }
    }
}
