//! Blob storage collaborator. The core only keeps the returned reference.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub trait Storage: Send + Sync {
    /// Store `bytes` and return an opaque reference to them.
    fn upload(&self, bytes: &[u8], name: &str) -> impl Future<Output = Result<String>> + Send;

    fn download(&self, storage_ref: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn delete(&self, storage_ref: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Files under a root directory, named `<uuid>.<original extension>`.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, storage_ref: &str) -> Result<PathBuf> {
        let path = Path::new(storage_ref);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(OrchestratorError::validation(format!(
                "storage ref outside storage root: {storage_ref}"
            )));
        }
        Ok(path.to_path_buf())
    }
}

fn stored_name(original: &str) -> String {
    let ext = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if !ext.is_empty() => format!("{}.{ext}", Uuid::new_v4()),
        _ => Uuid::new_v4().to_string(),
    }
}

fn not_found(storage_ref: &str, e: std::io::Error) -> OrchestratorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OrchestratorError::NotFound {
            kind: "object",
            id: storage_ref.to_string(),
        }
    } else {
        e.into()
    }
}

impl Storage for LocalStorage {
    async fn upload(&self, bytes: &[u8], name: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(OrchestratorError::validation("refusing to store an empty file"));
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(stored_name(name));
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "stored upload");
        Ok(path.display().to_string())
    }

    async fn download(&self, storage_ref: &str) -> Result<Vec<u8>> {
        let path = self.resolve(storage_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| not_found(storage_ref, e))
    }

    async fn delete(&self, storage_ref: &str) -> Result<()> {
        let path = self.resolve(storage_ref)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found(storage_ref, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("uploads"));

        let reference = storage.upload(b"RIFF....WAVE", "Meeting.WAV").await.unwrap();
        assert!(reference.ends_with(".wav"));
        assert!(!reference.contains("Meeting"));
        assert_eq!(storage.download(&reference).await.unwrap(), b"RIFF....WAVE");

        storage.delete(&reference).await.unwrap();
        let err = storage.download(&reference).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { kind: "object", .. }));
    }

    #[tokio::test]
    async fn names_are_unique_per_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let a = storage.upload(b"a", "same.mp3").await.unwrap();
        let b = storage.upload(b"b", "same.mp3").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn refs_outside_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("uploads"));
        let outside = format!("{}/uploads/../secret", dir.path().display());
        assert!(matches!(
            storage.download(&outside).await.unwrap_err(),
            OrchestratorError::Validation(_)
        ));
        assert!(storage.delete("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.upload(b"", "x.wav").await.is_err());
    }
}
