//! Filesystem-backed object store.
//!
//! Maps keys onto paths under a root directory. Writes land in a sibling
//! `.partial` file first and are renamed into place, so readers never see a
//! half-written object.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{ObjectStore, StorageError, StorageResult};

/// Object store rooted at a local (or mounted) directory
pub struct LocalObjectStore {
    /// Directory all keys are relative to
    root: PathBuf,

    /// Prefix for externally visible URIs (default: `file://{root}`)
    uri_base: String,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let uri_base = format!("file://{}", root.display());
        Self { root, uri_base }
    }

    /// Publish URIs under a different base (e.g. the bucket a mount mirrors)
    pub fn with_uri_base(mut self, uri_base: impl Into<String>) -> Self {
        self.uri_base = uri_base.into();
        self
    }

    /// Resolve a key to a path, rejecting keys that escape the root
    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        path.with_file_name(name)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn not_found(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    fn uri(&self, key: &str) -> String {
        format!("{}/{}", self.uri_base.trim_end_matches('/'), key)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await? && path.is_file())
    }

    async fn download(&self, key: &str, local_path: &Path) -> StorageResult<u64> {
        let path = self.path_for(key)?;
        Self::ensure_parent(local_path).await?;
        fs::copy(&path, local_path)
            .await
            .map_err(|e| not_found(key, e))
    }

    async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let partial = Self::partial_path(&path);
        fs::copy(local_path, &partial).await?;
        fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // Walk from the deepest directory the prefix fully names
        let start_dir = match prefix.rfind('/') {
            Some(idx) => self.path_for(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        let mut stack = vec![start_dir];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == "partial") {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| not_found(key, e))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let partial = Self::partial_path(&path);
        fs::write(&partial, data).await?;
        fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        Self::ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| not_found(from, e))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
