//! Filesystem artifact store for local development and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, ArtifactStore, StoredArtifact};

/// Stores artifacts under a root directory and hands out `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// The root is created if missing and made absolute.
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Root from `ARTIFACT_DIR` (default `./artifacts`).
    pub fn from_env() -> StorageResult<Self> {
        let root = std::env::var("ARTIFACT_DIR").unwrap_or_else(|_| "./artifacts".to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn artifact(&self, key: &str, path: &Path) -> StorageResult<StoredArtifact> {
        let url = Url::from_file_path(path)
            .map_err(|_| StorageError::InvalidKey(key.to_string()))?
            .to_string();
        Ok(StoredArtifact {
            key: key.to_string(),
            url,
        })
    }

    async fn prepare(&self, key: &str) -> StorageResult<PathBuf> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put_bytes(&self, key: &str, data: Vec<u8>, _content_type: &str) -> StorageResult<StoredArtifact> {
        let path = self.prepare(key).await?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        debug!("Stored {} bytes at {}", data.len(), path.display());
        self.artifact(key, &path)
    }

    async fn put_file(&self, key: &str, source: &Path, _content_type: &str) -> StorageResult<StoredArtifact> {
        let path = self.prepare(key).await?;
        tokio::fs::copy(source, &path)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", source.display(), e)))?;
        debug!("Stored {} at {}", source.display(), path.display());
        self.artifact(key, &path)
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::not_found(key));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u32> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else {
                    removed += 1;
                }
            }
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();

        let stored = store
            .put_bytes("tasks/t1/segments/000.wav", b"RIFF".to_vec(), "audio/wav")
            .await
            .unwrap();
        assert!(stored.url.starts_with("file://"));
        assert!(stored.url.ends_with("tasks/t1/segments/000.wav"));

        let out = dir.path().join("copy.wav");
        store.get_to_file(&stored.key, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"RIFF");
    }

    #[tokio::test]
    async fn test_put_file_and_delete_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().join("store")).unwrap();
        let source = dir.path().join("video.mp4");
        std::fs::write(&source, b"mp4").unwrap();

        store.put_file("tasks/t2/final.mp4", &source, "video/mp4").await.unwrap();
        store.put_bytes("tasks/t2/segments/001.mp4", vec![1], "video/mp4").await.unwrap();

        assert_eq!(store.delete_prefix("tasks/t2/").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("tasks/t2/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();

        let err = store.get_to_file("tasks/none.mp4", &dir.path().join("x")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(store.put_bytes("../escape", vec![], "text/plain").await.is_err());
    }
}
