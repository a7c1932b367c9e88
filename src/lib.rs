//! Hoard - content-addressed file storage and lifecycle engine.
//!
//! Maps per-owner file trees onto pluggable storage backends with atomic
//! quota accounting, hash-based dedup, content versions, a recycle bin and
//! streaming ZIP export.

pub mod config;
pub mod db;
pub mod error;
pub mod file;
pub mod logging;
pub mod storage;

pub use config::Config;
pub use db::{Database, NewOwner, Owner, OwnerRepository};
pub use error::{ErrorKind, HoardError, Result};
pub use file::{
    ContentIndexer, ExportManifest, FileNode, FileService, FileVersion, NoopIndexer, OpenedFile,
    RecycleSweeper, SkippedEntry, UploadRequest,
};
pub use storage::{
    BackendResolver, ByteStream, NewStoragePolicy, PolicyRepository, PolicyResolver, PolicyType,
    StorageBackend, StoragePolicy,
};
