//! Artifact store contract and key layout.

use std::path::Path;

use async_trait::async_trait;

use reel_models::TaskId;

use crate::error::{StorageError, StorageResult};

/// A persisted object and the URL other services can fetch it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: String,
    pub url: String,
}

/// Object storage for generated audio/video artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_bytes(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<StoredArtifact>;

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> StorageResult<StoredArtifact>;

    /// Copy a stored object to a local file.
    async fn get_to_file(&self, key: &str, path: &Path) -> StorageResult<()>;

    /// Delete every object under a prefix. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u32>;
}

/// Reject keys that could escape a prefix or root directory.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Key layout for task artifacts.
pub mod keys {
    use super::TaskId;

    pub fn task_prefix(task_id: TaskId) -> String {
        format!("tasks/{task_id}/")
    }

    pub fn segment_audio(task_id: TaskId, index: u32) -> String {
        format!("tasks/{task_id}/segments/{index:03}.wav")
    }

    pub fn segment_video(task_id: TaskId, index: u32) -> String {
        format!("tasks/{task_id}/segments/{index:03}.mp4")
    }

    pub fn final_video(task_id: TaskId) -> String {
        format!("tasks/{task_id}/final.mp4")
    }

    pub fn final_audio(task_id: TaskId) -> String {
        format!("tasks/{task_id}/final.wav")
    }

    pub fn thumbnail(task_id: TaskId) -> String {
        format!("tasks/{task_id}/thumb.jpg")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("tasks/a/segments/000.wav").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("tasks/../etc").is_err());
        assert!(validate_key("tasks//x").is_err());
    }

    #[test]
    fn test_key_layout() {
        let id = TaskId::new();
        assert_eq!(keys::segment_video(id, 7), format!("tasks/{id}/segments/007.mp4"));
        assert!(keys::final_video(id).starts_with(&keys::task_prefix(id)));
    }
}
