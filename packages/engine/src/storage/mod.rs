//! Pluggable blob storage for capture artifacts.
//!
//! The engine sees one narrow interface; the bytes live either on the local
//! filesystem or in an S3-compatible bucket. Keys are opaque here: layout
//! is decided by the worker (see [`crate::models::object_key`]) and the
//! store must preserve content byte-exactly.

pub mod local;
pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

pub use local::LocalStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("presigned URLs are not supported by this backend")]
    PresignUnsupported,

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// What a store knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub content_type: String,
}

/// Byte-addressable object store keyed by opaque string.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write exactly `bytes` under `key`, overwriting any previous object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<ObjectInfo, StorageError>;

    /// Read an object back. [`StorageError::NotFound`] for absent keys.
    async fn get(&self, key: &str) -> Result<(Vec<u8>, ObjectInfo), StorageError>;

    /// Remove an object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// A time-limited direct download URL. Only remote backends support
    /// this; the local backend returns [`StorageError::PresignUnsupported`].
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Construct the configured backend.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match config.backend {
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(&config.local_path)?)),
        StorageBackend::S3 => Ok(Arc::new(S3Store::new(config)?)),
    }
}
