//! Durable storage for processed images and export artifacts.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::error::ProcessingError;

#[async_trait]
pub trait OutputStore: Send + Sync + std::fmt::Debug {
    /// Write `bytes` under `key` (a relative, `/`-separated path) and return the URL the
    /// object can be retrieved from. Writing the same key twice replaces the object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<String, ProcessingError>;
}

/// Writes objects below a root directory
#[derive(Debug, Clone)]
pub struct FilesystemOutputStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FilesystemOutputStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a key; rejects keys that would escape the root
    pub fn path_for(&self, key: &str) -> Result<PathBuf, ProcessingError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ProcessingError::Storage(format!("invalid output key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl OutputStore for FilesystemOutputStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, ProcessingError> {
        let path = self.path_for(key)?;
        let storage_error =
            |e: std::io::Error| ProcessingError::Storage(format!("{}: {e}", path.display()));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_error)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(storage_error)?;

        let url = match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => {
                let absolute = tokio::fs::canonicalize(&path)
                    .await
                    .map_err(storage_error)?;
                Url::from_file_path(&absolute)
                    .map_err(|_| {
                        ProcessingError::Storage(format!(
                            "cannot express {} as a URL",
                            absolute.display()
                        ))
                    })?
                    .to_string()
            }
        };

        debug!(
            key = %key,
            bytes = bytes.len(),
            content_type = %content_type,
            url = %url,
            "💾 Output stored"
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_writes_file_and_returns_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemOutputStore::new(dir.path(), None);

        let url = store
            .put("batch/unit.png", b"png-bytes", "image/png")
            .await
            .unwrap();

        assert!(url.starts_with("file://"));
        assert!(url.ends_with("batch/unit.png"));
        let written = std::fs::read(dir.path().join("batch/unit.png")).unwrap();
        assert_eq!(written, b"png-bytes");
    }

    #[tokio::test]
    async fn test_public_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FilesystemOutputStore::new(dir.path(), Some("https://cdn.test/out/".to_string()));

        let url = store.put("b/export.csv", b"a,b", "text/csv").await.unwrap();
        assert_eq!(url, "https://cdn.test/out/b/export.csv");
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = FilesystemOutputStore::new("/tmp/out", None);
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("/abs").is_err());
        assert!(store.path_for("").is_err());
        assert!(store.path_for("a/b.png").is_ok());
    }
}
