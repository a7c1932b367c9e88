//! File service for Hoard.
//!
//! This module provides the high-level lifecycle API: folder creation,
//! uploads with dedup and quota checks, soft delete and restore, moves and
//! recursive copies, and permanent deletion with reference-counted
//! reclamation of physical objects.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use sqlx::{Executor, Sqlite, SqlitePool};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hash::HashingReader;
use super::indexer::{index_text, notify, ContentIndexer, NoopIndexer};
use super::ledger::ContentLedger;
use super::node::{FileNode, FileNodeRepository, NewFileNode};
use super::quota::QuotaLedger;
use super::version::FileVersionRepository;
use super::{extension_of, validate_name, MAX_TREE_DEPTH, ROOT_ID};
use crate::db::{Database, Owner, OwnerRepository};
use crate::storage::{BackendResolver, ByteStream, PolicyRepository, StorageBackend, StoragePolicy};
use crate::{HoardError, Result};

/// Default size below which uploaded text is passed to the indexer.
pub const DEFAULT_INDEX_TEXT_LIMIT: usize = 1024 * 1024;

/// Request for uploading a file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Target folder (0 = root).
    pub parent_id: i64,
    /// Display name.
    pub name: String,
    /// Declared size in bytes; the stream must deliver exactly this many.
    pub size: i64,
    /// Precomputed SHA-256 hex digest enabling instant upload.
    pub hash: Option<String>,
}

impl UploadRequest {
    /// Create a new upload request.
    pub fn new(parent_id: i64, name: impl Into<String>, size: i64) -> Self {
        Self {
            parent_id,
            name: name.into(),
            size,
            hash: None,
        }
    }

    /// Supply a precomputed content hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A file opened for download.
pub struct OpenedFile {
    /// The file node.
    pub node: FileNode,
    /// MIME type guessed from the name.
    pub content_type: String,
    /// Content stream.
    pub stream: ByteStream,
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("node", &self.node)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// File service handling the file tree and its content lifecycle.
#[derive(Clone)]
pub struct FileService {
    db: Arc<Database>,
    resolver: Arc<dyn BackendResolver>,
    indexer: Arc<dyn ContentIndexer>,
    index_text_limit: usize,
}

impl FileService {
    /// Create a new FileService.
    pub fn new(db: Arc<Database>, resolver: Arc<dyn BackendResolver>) -> Self {
        Self {
            db,
            resolver,
            indexer: Arc::new(NoopIndexer),
            index_text_limit: DEFAULT_INDEX_TEXT_LIMIT,
        }
    }

    /// Use `indexer` for content change notifications.
    pub fn with_indexer(mut self, indexer: Arc<dyn ContentIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    /// Set the size limit for text handed to the indexer.
    pub fn with_index_text_limit(mut self, limit: usize) -> Self {
        self.index_text_limit = limit;
        self
    }

    /// Get the underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub(crate) fn indexer(&self) -> &Arc<dyn ContentIndexer> {
        &self.indexer
    }

    pub(crate) fn index_text_limit(&self) -> usize {
        self.index_text_limit
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    async fn require_owner(&self, owner_id: i64) -> Result<Owner> {
        OwnerRepository::new(self.pool())
            .get_by_id(owner_id)
            .await?
            .ok_or(HoardError::OwnerNotFound(owner_id))
    }

    pub(crate) async fn policy(&self, policy_id: i64) -> Result<StoragePolicy> {
        PolicyRepository::new(self.pool())
            .get_by_id(policy_id)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("storage policy {policy_id}")))
    }

    /// Policy and live backend holding objects of `policy_id`.
    pub(crate) async fn backend_for(
        &self,
        policy_id: i64,
    ) -> Result<(StoragePolicy, Arc<dyn StorageBackend>)> {
        let policy = self.policy(policy_id).await?;
        let backend = self.resolver.resolve(&policy)?;
        Ok((policy, backend))
    }

    /// Live file node owned by `owner_id`; folders are rejected.
    pub(crate) async fn require_live_file(&self, owner_id: i64, id: i64) -> Result<FileNode> {
        let node = FileNodeRepository::get_live(self.pool(), owner_id, id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(id))?;
        if node.is_folder {
            return Err(HoardError::Validation(format!(
                "{} is a folder",
                node.name
            )));
        }
        Ok(node)
    }

    /// Delete a physical object, logging instead of failing.
    pub(crate) async fn discard_object(&self, policy_id: i64, path: &str) {
        let backend = match self.backend_for(policy_id).await {
            Ok((_, backend)) => backend,
            Err(e) => {
                warn!(policy_id, path, "cannot resolve backend to delete object: {}", e);
                return;
            }
        };
        match backend.delete(path).await {
            Ok(()) => debug!(policy_id, path, "deleted object"),
            Err(HoardError::NotFound(_)) => debug!(policy_id, path, "object already gone"),
            Err(e) => warn!(policy_id, path, "failed to delete object: {}", e),
        }
    }

    /// Get a node owned by `owner_id`, live or recycled.
    pub async fn get_node(&self, owner_id: i64, id: i64) -> Result<FileNode> {
        FileNodeRepository::get_owned(self.pool(), owner_id, id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(id))
    }

    /// List live direct children of a folder (0 = root).
    pub async fn list_children(&self, owner_id: i64, parent_id: i64) -> Result<Vec<FileNode>> {
        require_parent(self.pool(), owner_id, parent_id).await?;
        FileNodeRepository::list_children(self.pool(), owner_id, parent_id).await
    }

    /// List live favorites.
    pub async fn list_favorites(&self, owner_id: i64) -> Result<Vec<FileNode>> {
        FileNodeRepository::list_favorites(self.pool(), owner_id).await
    }

    /// List the recycle bin, most recently deleted first.
    pub async fn list_recycle_bin(&self, owner_id: i64) -> Result<Vec<FileNode>> {
        FileNodeRepository::list_recycled(self.pool(), owner_id).await
    }

    /// Live nodes whose name contains `keyword`.
    pub async fn search(&self, owner_id: i64, keyword: &str) -> Result<Vec<FileNode>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }
        FileNodeRepository::search(self.pool(), owner_id, keyword).await
    }

    /// Total size of live files below a folder (0 = whole namespace).
    pub async fn folder_size(&self, owner_id: i64, folder_id: i64) -> Result<i64> {
        require_parent(self.pool(), owner_id, folder_id).await?;

        let mut total = 0;
        let mut pending = vec![folder_id];
        while let Some(parent) = pending.pop() {
            for child in FileNodeRepository::list_children(self.pool(), owner_id, parent).await? {
                if child.is_folder {
                    pending.push(child.id);
                } else {
                    total += child.size;
                }
            }
        }
        Ok(total)
    }

    /// Open a live file for reading.
    pub async fn open(&self, owner_id: i64, id: i64) -> Result<OpenedFile> {
        let node = self.require_live_file(owner_id, id).await?;
        let (_, backend) = self.backend_for(node.policy_id).await?;
        let stream = backend.get(node.content_path()?).await?;
        let content_type = mime_guess::from_path(&node.name)
            .first_or_octet_stream()
            .to_string();

        Ok(OpenedFile {
            node,
            content_type,
            stream,
        })
    }

    /// Direct link for a live file, if one can be produced.
    ///
    /// A policy `base_url` wins over the backend's own link. Backend failures
    /// are logged and yield `None`.
    pub async fn download_url(&self, owner_id: i64, id: i64) -> Result<Option<String>> {
        let node = self.require_live_file(owner_id, id).await?;
        let path = node.content_path()?;
        let policy = self.policy(node.policy_id).await?;

        if let Some(url) = policy.public_url(path) {
            return Ok(Some(url));
        }

        let backend = match self.resolver.resolve(&policy) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(file_id = id, "cannot resolve backend for link: {}", e);
                return Ok(None);
            }
        };
        match backend.get_url(path).await {
            Ok(url) => Ok(url),
            Err(e) => {
                warn!(file_id = id, "backend could not produce a link: {}", e);
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a folder.
    pub async fn create_folder(&self, owner_id: i64, parent_id: i64, name: &str) -> Result<FileNode> {
        let name = validate_name(name)?;
        self.require_owner(owner_id).await?;

        let mut tx = self.db.begin().await?;
        require_parent(&mut *tx, owner_id, parent_id).await?;
        let folder =
            FileNodeRepository::insert(&mut *tx, &NewFileNode::folder(owner_id, parent_id, name))
                .await?;
        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        info!(owner_id, folder_id = folder.id, "created folder");
        Ok(folder)
    }

    /// Upload a file.
    pub async fn upload<R>(&self, owner_id: i64, request: &UploadRequest, reader: R) -> Result<FileNode>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.upload_inner(owner_id, request, reader, None).await
    }

    /// Upload a file, aborting when `cancel` fires.
    ///
    /// A cancelled upload writes no record and removes any partial object.
    pub async fn upload_cancellable<R>(
        &self,
        owner_id: i64,
        request: &UploadRequest,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<FileNode>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.upload_inner(owner_id, request, reader, Some(cancel))
            .await
    }

    async fn upload_inner<R>(
        &self,
        owner_id: i64,
        request: &UploadRequest,
        reader: R,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileNode>
    where
        R: AsyncRead + Send + Unpin,
    {
        let name = validate_name(&request.name)?;
        if request.size < 0 {
            return Err(HoardError::Validation("size must not be negative".to_string()));
        }

        // Rejections happen before any byte moves
        QuotaLedger::preflight(self.pool(), owner_id, request.size).await?;
        require_parent(self.pool(), owner_id, request.parent_id).await?;

        if let Some(hash) = request.hash.as_deref().filter(|h| !h.is_empty()) {
            if let Some(node) = self.instant_upload(owner_id, request, &name, hash).await? {
                return Ok(node);
            }
        }

        let policy = PolicyRepository::new(self.pool()).get_default().await?;
        let backend = self.resolver.resolve(&policy)?;
        let path = format!(
            "uploads/{owner_id}/{}{}",
            Uuid::new_v4().simple(),
            extension_of(&name)
        );
        let size = request.size as u64;

        let mut hashing = HashingReader::new(reader, self.index_text_limit);
        let put = backend.put(&path, &mut hashing, size);
        let stored = match cancel {
            Some(token) => {
                tokio::select! {
                    result = put => result,
                    _ = token.cancelled() => Err(HoardError::Cancelled),
                }
            }
            None => put.await,
        };
        if let Err(e) = stored {
            self.discard_object(policy.id, &path).await;
            return Err(e);
        }

        let outcome = hashing.finish();
        if outcome.bytes_read != size {
            self.discard_object(policy.id, &path).await;
            return Err(HoardError::BackendWrite(format!(
                "{path}: expected {size} bytes, received {}",
                outcome.bytes_read
            )));
        }

        let new_node = NewFileNode::file(
            owner_id,
            request.parent_id,
            name,
            request.size,
            outcome.hash,
            path.as_str(),
            policy.id,
        );
        let node = match self.insert_charged(owner_id, &new_node).await {
            Ok(node) => node,
            Err(e) => {
                self.discard_object(policy.id, &path).await;
                return Err(e);
            }
        };

        info!(
            owner_id,
            file_id = node.id,
            size = node.size,
            backend = backend.kind(),
            "uploaded file"
        );
        notify(
            &self.indexer,
            node.id,
            owner_id,
            node.name.clone(),
            index_text(outcome.captured),
        );
        Ok(node)
    }

    /// Reserve quota and insert `node` in one transaction.
    async fn insert_charged(&self, owner_id: i64, node: &NewFileNode) -> Result<FileNode> {
        let mut tx = self.db.begin().await?;
        require_parent(&mut *tx, owner_id, node.parent_id).await?;
        QuotaLedger::reserve(&mut tx, owner_id, node.size).await?;
        let node = FileNodeRepository::insert(&mut *tx, node).await?;
        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;
        Ok(node)
    }

    /// Reference existing content instead of storing the bytes again.
    ///
    /// Returns `None` when no live file matches the hash and size.
    async fn instant_upload(
        &self,
        owner_id: i64,
        request: &UploadRequest,
        name: &str,
        hash: &str,
    ) -> Result<Option<FileNode>> {
        let mut tx = self.db.begin().await?;

        let existing = match ContentLedger::find_live_by_hash(&mut *tx, hash).await? {
            Some(existing) if existing.size == request.size => existing,
            _ => return Ok(None),
        };
        let Some(path) = existing.path.as_deref() else {
            return Ok(None);
        };

        require_parent(&mut *tx, owner_id, request.parent_id).await?;
        QuotaLedger::reserve(&mut tx, owner_id, request.size).await?;
        let node = FileNodeRepository::insert(
            &mut *tx,
            &NewFileNode::file(
                owner_id,
                request.parent_id,
                name,
                request.size,
                hash,
                path,
                existing.policy_id,
            ),
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        info!(
            owner_id,
            file_id = node.id,
            source_id = existing.id,
            "instant upload"
        );
        notify(&self.indexer, node.id, owner_id, node.name.clone(), String::new());
        Ok(Some(node))
    }

    // ------------------------------------------------------------------
    // Attribute mutations
    // ------------------------------------------------------------------

    /// Rename a live node.
    pub async fn rename(&self, owner_id: i64, id: i64, new_name: &str) -> Result<FileNode> {
        let name = validate_name(new_name)?;
        if !FileNodeRepository::rename(self.pool(), owner_id, id, &name).await? {
            return Err(HoardError::node_not_found(id));
        }
        self.get_node(owner_id, id).await
    }

    /// Flip the favorite flag and return the new value.
    pub async fn toggle_favorite(&self, owner_id: i64, id: i64) -> Result<bool> {
        FileNodeRepository::toggle_favorite(self.pool(), owner_id, id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(id))
    }

    /// Move a live node under another folder (0 = root).
    ///
    /// Moving a folder into itself or any of its descendants is `InvalidMove`.
    pub async fn move_node(&self, owner_id: i64, id: i64, new_parent_id: i64) -> Result<FileNode> {
        if id == new_parent_id {
            return Err(HoardError::InvalidMove(format!(
                "cannot move node {id} into itself"
            )));
        }

        let mut tx = self.db.begin().await?;
        FileNodeRepository::get_live(&mut *tx, owner_id, id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(id))?;
        require_parent(&mut *tx, owner_id, new_parent_id).await?;

        // Walk from the new parent up to the root looking for the node
        let mut current = new_parent_id;
        let mut depth = 0;
        while current != ROOT_ID {
            if current == id {
                return Err(HoardError::InvalidMove(format!(
                    "cannot move node {id} into its own descendant {new_parent_id}"
                )));
            }
            depth += 1;
            if depth > MAX_TREE_DEPTH {
                return Err(HoardError::InvalidMove(format!(
                    "folder nesting deeper than {MAX_TREE_DEPTH}"
                )));
            }
            current = match FileNodeRepository::get_owned(&mut *tx, owner_id, current).await? {
                Some(ancestor) => ancestor.parent_id,
                None => break,
            };
        }

        FileNodeRepository::set_parent(&mut *tx, owner_id, id, new_parent_id).await?;
        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        info!(owner_id, file_id = id, new_parent_id, "moved node");
        self.get_node(owner_id, id).await
    }

    /// Copy a live node, recursively for folders, to another owner or parent.
    ///
    /// Copied files share the source's physical objects. The destination
    /// owner is charged the whole subtree size once, before any node is
    /// written; recycled descendants are not copied.
    pub async fn copy(&self, source: &FileNode, dest_owner_id: i64, dest_parent_id: i64) -> Result<FileNode> {
        let mut tx = self.db.begin().await?;

        let root = FileNodeRepository::get_live(&mut *tx, source.owner_id, source.id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(source.id))?;

        // Snapshot first so copying into a descendant terminates
        let mut nodes = vec![root];
        let mut next = 0;
        while next < nodes.len() {
            if nodes[next].is_folder {
                let children =
                    FileNodeRepository::list_children(&mut *tx, source.owner_id, nodes[next].id)
                        .await?;
                nodes.extend(children);
            }
            next += 1;
        }
        let total: i64 = nodes.iter().filter(|n| !n.is_folder).map(|n| n.size).sum();

        require_parent(&mut *tx, dest_owner_id, dest_parent_id).await?;
        QuotaLedger::reserve(&mut tx, dest_owner_id, total).await?;

        let mut new_ids: HashMap<i64, i64> = HashMap::with_capacity(nodes.len());
        let mut copied_root = None;
        for (i, node) in nodes.iter().enumerate() {
            let parent_id = if i == 0 {
                dest_parent_id
            } else {
                *new_ids
                    .get(&node.parent_id)
                    .ok_or_else(|| HoardError::node_not_found(node.parent_id))?
            };
            let copied = FileNodeRepository::insert(
                &mut *tx,
                &NewFileNode::copy_of(node, dest_owner_id, parent_id),
            )
            .await?;
            new_ids.insert(node.id, copied.id);
            if i == 0 {
                copied_root = Some(copied);
            }
        }

        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        let copied_root = copied_root.ok_or_else(|| HoardError::node_not_found(source.id))?;
        info!(
            source_id = source.id,
            dest_owner_id,
            copy_id = copied_root.id,
            nodes = nodes.len(),
            bytes = total,
            "copied node"
        );
        Ok(copied_root)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move a live node into the recycle bin. Recycling twice is a no-op.
    pub async fn soft_delete(&self, owner_id: i64, id: i64) -> Result<()> {
        if FileNodeRepository::mark_deleted(self.pool(), owner_id, id, Utc::now()).await? {
            info!(owner_id, file_id = id, "moved node to recycle bin");
            return Ok(());
        }
        self.get_node(owner_id, id).await.map(|_| ())
    }

    /// Bring a node back from the recycle bin.
    ///
    /// If its parent folder no longer exists, or is itself hidden in the
    /// recycle bin, the node lands in the root.
    pub async fn restore(&self, owner_id: i64, id: i64) -> Result<FileNode> {
        let mut tx = self.db.begin().await?;
        let node = FileNodeRepository::get_owned(&mut *tx, owner_id, id)
            .await?
            .ok_or_else(|| HoardError::node_not_found(id))?;
        if node.is_live() {
            return Ok(node);
        }

        let parent_id = if reachable_folder(&mut tx, owner_id, node.parent_id).await? {
            node.parent_id
        } else {
            ROOT_ID
        };

        FileNodeRepository::clear_deleted(&mut *tx, owner_id, id, parent_id).await?;
        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        info!(owner_id, file_id = id, parent_id, "restored node");
        self.get_node(owner_id, id).await
    }

    /// Permanently delete a node owned by `owner_id`, live or recycled.
    ///
    /// Returns the number of node records removed.
    pub async fn permanent_delete(&self, owner_id: i64, id: i64) -> Result<u64> {
        let node = self.get_node(owner_id, id).await?;
        self.purge_subtree(node.id).await
    }

    /// Permanently delete a node by id regardless of owner.
    ///
    /// Purging an id that is already gone removes nothing and succeeds.
    pub async fn purge(&self, id: i64) -> Result<u64> {
        self.purge_subtree(id).await
    }

    async fn purge_subtree(&self, root_id: i64) -> Result<u64> {
        let mut tx = self.db.begin().await?;

        let Some(root) = FileNodeRepository::get_by_id(&mut *tx, root_id).await? else {
            return Ok(0);
        };
        let owner_id = root.owner_id;

        let mut nodes = vec![root];
        let mut next = 0;
        while next < nodes.len() {
            if nodes[next].is_folder {
                let children =
                    FileNodeRepository::list_children_any_state(&mut *tx, owner_id, nodes[next].id)
                        .await?;
                nodes.extend(children);
            }
            next += 1;
        }

        let mut removed = 0u64;
        let mut released = 0i64;
        let mut candidates: BTreeSet<(i64, String)> = BTreeSet::new();

        // Children before parents
        for node in nodes.iter().rev() {
            for version in FileVersionRepository::delete_by_file(&mut *tx, node.id).await? {
                candidates.insert((version.policy_id, version.path));
            }
            if !FileNodeRepository::delete(&mut *tx, node.id).await? {
                continue;
            }
            removed += 1;
            if !node.is_folder {
                released += node.size;
                if let Some(path) = &node.path {
                    candidates.insert((node.policy_id, path.clone()));
                }
            }
        }

        if released > 0 {
            QuotaLedger::release(&mut tx, owner_id, released).await?;
        }

        let mut orphans = Vec::new();
        for (policy_id, path) in candidates {
            if ContentLedger::reference_count(&mut *tx, policy_id, &path).await? == 0 {
                orphans.push((policy_id, path));
            }
        }

        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        for (policy_id, path) in &orphans {
            self.discard_object(*policy_id, path).await;
        }

        info!(
            owner_id,
            file_id = root_id,
            removed,
            released,
            objects = orphans.len(),
            "permanently deleted"
        );
        Ok(removed)
    }
}

/// Whether `folder_id` is the root, or a live folder of `owner_id` whose
/// ancestors are all live.
async fn reachable_folder(
    conn: &mut sqlx::SqliteConnection,
    owner_id: i64,
    folder_id: i64,
) -> Result<bool> {
    let mut current = folder_id;
    for _ in 0..=MAX_TREE_DEPTH {
        if current == ROOT_ID {
            return Ok(true);
        }
        match FileNodeRepository::get_live(&mut *conn, owner_id, current).await? {
            Some(folder) if folder.is_folder => current = folder.parent_id,
            _ => return Ok(false),
        }
    }
    Ok(false)
}

/// Fail unless `parent_id` is the root or a live folder of `owner_id`.
async fn require_parent<'e, E>(executor: E, owner_id: i64, parent_id: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    if parent_id == ROOT_ID {
        return Ok(());
    }
    match FileNodeRepository::get_live(executor, owner_id, parent_id).await? {
        Some(parent) if parent.is_folder => Ok(()),
        _ => Err(HoardError::NotFound(format!("folder {parent_id}"))),
    }
}
