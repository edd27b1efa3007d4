use crate::errors::{Error, Result};
use crate::utils::fs_atomic::atomic_write;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Plain key/value blob storage used for configuration and secret backups.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;
}

/// Blob store rooted at a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|part| matches!(part, Component::Normal(_)));
        if !clean {
            return Err(Error::Config(format!("invalid blob key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for DirectoryBlobStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::task::spawn_blocking(move || atomic_write(&path, &body, 0o600))
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob '{}'", key)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let entries = tokio::task::spawn_blocking(move || collect_entries(&root, &prefix))
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))??;
        Ok(entries)
    }
}

fn collect_entries(root: &Path, prefix: &str) -> std::io::Result<Vec<BlobEntry>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        // In-flight atomic writes.
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let key = relative.to_string_lossy().replace('\\', "/");
        if !key.starts_with(prefix) {
            continue;
        }
        let last_modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
        out.push(BlobEntry { key, last_modified });
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}
