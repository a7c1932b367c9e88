//! Test helpers for integration tests.
//!
//! Provides an in-memory backend that counts writes and deletes, a resolver
//! that hands it out for every policy, and setup helpers for a service over
//! an in-memory or an on-disk database.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use hoard::storage::PutReader;
use hoard::{
    BackendResolver, ByteStream, Database, FileNode, FileService, HoardError, NewOwner,
    NewStoragePolicy, OwnerRepository, PolicyRepository, Result, StorageBackend, StoragePolicy,
    UploadRequest,
};

/// In-memory backend that records how often objects are written and removed.
#[derive(Default)]
pub struct CountingBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unreadable: Mutex<HashSet<String>>,
    torn: Mutex<HashSet<String>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Completed `put` calls.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// `delete` calls, including ones for absent objects.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Make `get` fail for `path` from now on.
    pub fn break_reads(&self, path: &str) {
        self.unreadable.lock().unwrap().insert(path.to_string());
    }

    /// Make reads of `path` fail after the first half of the bytes.
    pub fn tear_reads(&self, path: &str) {
        self.torn.lock().unwrap().insert(path.to_string());
    }
}

/// Reader that always fails.
struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "torn read")))
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn kind(&self) -> &'static str {
        "counting"
    }

    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            // Not atomic, like a plain remote file write: what arrived stays
            self.objects.lock().unwrap().insert(path.to_string(), buf);
            return Err(e.into());
        }
        if buf.len() as u64 != size {
            return Err(HoardError::BackendWrite(format!(
                "expected {size} bytes, got {}",
                buf.len()
            )));
        }
        self.objects.lock().unwrap().insert(path.to_string(), buf);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        if self.unreadable.lock().unwrap().contains(path) {
            return Err(HoardError::BackendRead(format!("{path}: broken")));
        }
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| HoardError::NotFound(format!("object {path}")))?;
        if self.torn.lock().unwrap().contains(path) {
            let half = bytes[..bytes.len() / 2].to_vec();
            return Ok(Box::new(io::Cursor::new(half).chain(FailingReader)));
        }
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.contains(path))
    }

    async fn get_url(&self, _path: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Resolver returning the same backend for every policy.
pub struct FixedResolver(pub Arc<CountingBackend>);

impl BackendResolver for FixedResolver {
    fn resolve(&self, _policy: &StoragePolicy) -> Result<Arc<dyn StorageBackend>> {
        Ok(self.0.clone())
    }
}

/// A service with one default policy.
pub struct TestEnv {
    pub service: FileService,
    pub backend: Arc<CountingBackend>,
    pub policy_id: i64,
    _dir: Option<TempDir>,
}

impl TestEnv {
    /// In-memory database on a single connection.
    pub async fn new() -> Self {
        let db = Database::open_in_memory().await.unwrap();
        Self::with_database(db, None).await
    }

    /// On-disk database with a pool of several connections, so transactions
    /// from different tasks really overlap.
    pub async fn on_disk() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::open_with(dir.path().join("hoard.db"), 8)
            .await
            .unwrap();
        Self::with_database(db, Some(dir)).await
    }

    async fn with_database(db: Database, dir: Option<TempDir>) -> Self {
        hoard::logging::init_for_tests();
        let policy = PolicyRepository::new(db.pool())
            .create(&NewStoragePolicy::local("memory", "/unused").with_default(true))
            .await
            .unwrap();
        let backend = CountingBackend::new();
        let service = FileService::new(Arc::new(db), Arc::new(FixedResolver(backend.clone())));
        Self {
            service,
            backend,
            policy_id: policy.id,
            _dir: dir,
        }
    }

    /// Create an owner with `total` bytes of quota and return its id.
    pub async fn owner(&self, name: &str, total: i64) -> i64 {
        OwnerRepository::new(self.service.database().pool())
            .create(&NewOwner::new(name, total))
            .await
            .unwrap()
            .id
    }

    pub async fn used(&self, owner_id: i64) -> i64 {
        OwnerRepository::new(self.service.database().pool())
            .get_by_id(owner_id)
            .await
            .unwrap()
            .unwrap()
            .used_size
    }

    /// Upload `body` as `name` under `parent`.
    pub async fn upload(&self, owner_id: i64, parent_id: i64, name: &str, body: &[u8]) -> FileNode {
        self.service
            .upload(
                owner_id,
                &UploadRequest::new(parent_id, name, body.len() as i64),
                body,
            )
            .await
            .unwrap()
    }

    pub async fn read(&self, owner_id: i64, id: i64) -> Vec<u8> {
        let mut opened = self.service.open(owner_id, id).await.unwrap();
        let mut out = Vec::new();
        opened.stream.read_to_end(&mut out).await.unwrap();
        out
    }

    /// Backdate a recycled node's deletion time.
    pub async fn backdate_deletion(&self, id: i64, days: i64) {
        sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ?")
            .bind(chrono::Utc::now() - chrono::Duration::days(days))
            .bind(id)
            .execute(self.service.database().pool())
            .await
            .unwrap();
    }
}
