//! Local disk storage backend.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{clean_key, ensure_complete, ByteStream, PutReader, StorageBackend};
use crate::{HoardError, Result};

/// Stores objects as plain files below a root directory.
///
/// ```text
/// {root}/
/// └── uploads/
///     └── 3/
///         ├── 6f1c0c2e-....txt
///         └── 6f1c0c2e-....txt.v1718000000000000000
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage path to a file below the root.
    pub fn file_path(&self, path: &str) -> Result<PathBuf> {
        let key = clean_key(path)?;
        Ok(self.root.join(key))
    }
}

/// Staging file removed on drop unless it was renamed into place.
///
/// Covers error returns as well as a `put` future dropped mid-write.
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let target = self.file_path(path)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HoardError::BackendWrite(format!("{}: {e}", parent.display())))?;
        }

        // Write beside the target and rename, so an overwrite never leaves a
        // half-written live object behind.
        let mut staging = Staging::new(target.with_file_name(format!(
            ".{}.{}.part",
            target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("object"),
            Uuid::new_v4().simple()
        )));

        let written = async {
            let mut file = fs::File::create(&staging.path).await?;
            let n = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(n)
        }
        .await
        .map_err(|e| HoardError::BackendWrite(format!("{path}: {e}")))?;

        ensure_complete(path, written, size)?;

        fs::rename(&staging.path, &target)
            .await
            .map_err(|e| HoardError::BackendWrite(format!("{path}: {e}")))?;
        staging.committed = true;

        debug!(path, bytes = written, "stored object on local disk");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let target = self.file_path(path)?;

        match fs::File::open(&target).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HoardError::NotFound(format!("object {path}")))
            }
            Err(e) => Err(HoardError::BackendRead(format!("{path}: {e}"))),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.file_path(path)?;

        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HoardError::BackendWrite(format!("delete {path}: {e}"))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.file_path(path)?;
        fs::try_exists(&target)
            .await
            .map_err(|e| HoardError::BackendRead(format!("{path}: {e}")))
    }

    async fn get_url(&self, _path: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
