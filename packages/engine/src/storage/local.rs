//! Filesystem-backed blob store.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BlobStore, ObjectInfo, StorageError};

/// Stores each object as a file under a root directory, using the key as a
/// relative path. Writes go to a sibling temp file first and are renamed
/// into place so readers never observe partial content.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve a key under the root, refusing absolute paths and `..`
    /// traversal. Keys come from our own key builder, but the store is a
    /// trust boundary of its own.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(key);
        let safe = !key.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<ObjectInfo, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: bytes.len() as i64,
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, ObjectInfo), StorageError> {
        let path = self.resolve(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let info = ObjectInfo {
            key: key.to_string(),
            size: bytes.len() as i64,
            // The filesystem keeps no content-type; callers that care carry
            // it in the output catalog row.
            content_type: "application/octet-stream".to_string(),
        };
        Ok((bytes, info))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    async fn presign(&self, _key: &str, _ttl: Duration) -> Result<String, StorageError> {
        Err(StorageError::PresignUnsupported)
    }
}
