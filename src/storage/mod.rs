//! Storage backends for Hoard.
//!
//! A [`StorageBackend`] is a uniform capability contract over one concrete
//! medium. Backends address objects by storage-relative paths such as
//! `uploads/3/6f1c...e2.txt`; the file tree decides the paths, backends only
//! store bytes.
//!
//! Backends are produced from [`StoragePolicy`] records by a
//! [`BackendResolver`].

mod local;
mod object;
mod onedrive;
mod policy;
mod resolver;
mod sftp;

pub use local::LocalBackend;
pub use object::ObjectStoreBackend;
pub use onedrive::{OneDriveBackend, CHUNK_SIZE as ONEDRIVE_CHUNK_SIZE, SIMPLE_UPLOAD_LIMIT};
pub use policy::{
    BackendConfig, CosConfig, LocalConfig, NewStoragePolicy, OneDriveConfig, OssConfig,
    PolicyRepository, PolicyType, S3Config, SftpConfig, StoragePolicy,
};
pub use resolver::{BackendResolver, PolicyResolver};
pub use sftp::SftpBackend;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{HoardError, Result};

/// Readable byte stream handed out by [`StorageBackend::get`].
///
/// Dropping the stream releases whatever the backend holds for it.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Reader accepted by [`StorageBackend::put`].
pub type PutReader<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Copy buffer size used when pumping readers into remote writers.
pub(crate) const COPY_BUF_SIZE: usize = 256 * 1024;

/// Uniform contract over a storage medium.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs (`local`, `s3`, ...).
    fn kind(&self) -> &'static str;

    /// Store exactly `size` bytes read from `reader` at `path`.
    ///
    /// Intermediate structure is created as needed. The reader is drained
    /// completely; a byte count other than `size` is a `BackendWrite` error.
    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()>;

    /// Open a readable stream for `path`.
    ///
    /// Fails with `NotFound` if the object is absent, `BackendRead` otherwise.
    async fn get(&self, path: &str) -> Result<ByteStream>;

    /// Remove the object at `path`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check whether an object exists. Absence is `Ok(false)`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Direct or presigned URL for `path`, `None` when the medium has no
    /// direct-link capability.
    async fn get_url(&self, path: &str) -> Result<Option<String>>;
}

/// Validate a storage-relative path and return it without leading slashes.
///
/// Rejects empty paths and any `..` or `.` segment.
pub(crate) fn clean_key(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(HoardError::Validation("storage path is empty".to_string()));
    }
    if trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(HoardError::Validation(format!(
            "storage path contains an invalid character: {path}"
        )));
    }
    if trimmed
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(HoardError::Validation(format!(
            "storage path is not normalized: {path}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Join a configured root directory and a storage key with exactly one `/`.
pub(crate) fn join_root(root: &str, key: &str) -> String {
    if root.is_empty() {
        return key.to_string();
    }
    format!("{}/{key}", root.trim_end_matches('/'))
}

/// Fail unless the number of bytes received matches the declared size.
pub(crate) fn ensure_complete(path: &str, received: u64, size: u64) -> Result<()> {
    if received != size {
        return Err(HoardError::BackendWrite(format!(
            "{path}: expected {size} bytes, received {received}"
        )));
    }
    Ok(())
}

/// Read up to `buf.len()` bytes, retrying until the buffer is full or EOF.
///
/// Returns the number of bytes read; less than `buf.len()` only at EOF.
pub(crate) async fn read_full(reader: PutReader<'_>, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
