//! Content edits and version restore.
//!
//! Every content change first copies the current bytes to
//! `<path>.v<unix-nanos>` and records a [`FileVersion`]. Capturing the
//! snapshot is best effort; the change itself is not.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::hash::sha256_hex;
use super::indexer::notify;
use super::ledger::ContentLedger;
use super::node::{FileNode, FileNodeRepository};
use super::quota::QuotaLedger;
use super::service::FileService;
use super::version::{FileVersion, FileVersionRepository, NewFileVersion};
use crate::storage::{PutReader, StorageBackend};
use crate::{HoardError, Result};

/// New content for a live file.
struct Replacement<'r> {
    reader: PutReader<'r>,
    size: i64,
    hash: String,
}

impl FileService {
    /// Replace a live file's content, keeping the old bytes as a version.
    pub async fn edit_content(&self, owner_id: i64, id: i64, content: &[u8]) -> Result<FileNode> {
        let node = self.require_live_file(owner_id, id).await?;
        let mut reader = content;
        let replacement = Replacement {
            reader: &mut reader,
            size: content.len() as i64,
            hash: sha256_hex(content),
        };

        let updated = self.replace_content(&node, replacement).await?;

        let text = if content.len() < self.index_text_limit() {
            std::str::from_utf8(content).unwrap_or_default().to_string()
        } else {
            String::new()
        };
        notify(self.indexer(), updated.id, owner_id, updated.name.clone(), text);

        info!(owner_id, file_id = id, size = updated.size, "edited file content");
        Ok(updated)
    }

    /// Bring a file back to the content of one of its versions.
    ///
    /// The content being replaced is itself kept as a new version.
    pub async fn restore_version(&self, owner_id: i64, version_id: i64) -> Result<FileNode> {
        let version = FileVersionRepository::get_by_id(self.pool(), version_id)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("version {version_id}")))?;
        let node = self.require_live_file(owner_id, version.file_id).await?;

        QuotaLedger::preflight(self.pool(), owner_id, version.size - node.size).await?;

        let (_, source) = self.backend_for(version.policy_id).await?;
        let mut stream = source.get(&version.path).await?;
        let replacement = Replacement {
            reader: &mut stream,
            size: version.size,
            hash: version.hash.clone(),
        };

        let updated = self.replace_content(&node, replacement).await?;
        info!(
            owner_id,
            file_id = node.id,
            version_id,
            size = updated.size,
            "restored file version"
        );
        Ok(updated)
    }

    /// Versions of a file, newest first.
    pub async fn list_versions(&self, owner_id: i64, id: i64) -> Result<Vec<FileVersion>> {
        let node = self.get_node(owner_id, id).await?;
        FileVersionRepository::list_by_file(self.pool(), node.id).await
    }

    /// Swap a file's content for `new`.
    ///
    /// The new bytes always land in a fresh object and the live object is
    /// never written, so a failed or interrupted write leaves the file as it
    /// was. The old object is deleted once no node references it.
    async fn replace_content(&self, node: &FileNode, new: Replacement<'_>) -> Result<FileNode> {
        let delta = new.size - node.size;
        QuotaLedger::preflight(self.pool(), node.owner_id, delta).await?;

        let (_, backend) = self.backend_for(node.policy_id).await?;
        let live_path = node.content_path()?.to_string();
        let target_path = format!(
            "uploads/{}/{}{}",
            node.owner_id,
            Uuid::new_v4().simple(),
            node.ext
        );

        let snapshot = snapshot(backend.as_ref(), node, &live_path).await;

        if let Err(e) = backend.put(&target_path, new.reader, new.size as u64).await {
            self.discard_written(node.policy_id, &target_path, snapshot.as_ref())
                .await;
            return Err(e);
        }

        // Counting under the write lock keeps dedup from attaching to the old
        // object between the count and the delete
        let committed: Result<bool> = async {
            let mut tx = self.database().begin().await?;
            QuotaLedger::apply_delta(&mut tx, node.owner_id, delta).await?;
            let swapped = FileNodeRepository::update_content(
                &mut *tx,
                node.id,
                &live_path,
                new.size,
                &new.hash,
                &target_path,
            )
            .await?;
            if !swapped {
                let live = FileNodeRepository::get_live(&mut *tx, node.owner_id, node.id).await?;
                return Err(match live {
                    Some(_) => HoardError::Conflict(format!(
                        "file {} was modified concurrently",
                        node.id
                    )),
                    None => HoardError::node_not_found(node.id),
                });
            }
            if let Some(version) = &snapshot {
                FileVersionRepository::insert(&mut *tx, version).await?;
            }
            let orphaned =
                ContentLedger::reference_count(&mut *tx, node.policy_id, &live_path).await? == 0;
            tx.commit()
                .await
                .map_err(|e| HoardError::Database(e.to_string()))?;
            Ok(orphaned)
        }
        .await;

        match committed {
            Ok(true) => self.discard_object(node.policy_id, &live_path).await,
            Ok(false) => {}
            Err(e) => {
                self.discard_written(node.policy_id, &target_path, snapshot.as_ref())
                    .await;
                return Err(e);
            }
        }

        self.get_node(node.owner_id, node.id).await
    }

    /// Remove the objects written for a content change that did not land.
    async fn discard_written(
        &self,
        policy_id: i64,
        target_path: &str,
        snapshot: Option<&NewFileVersion>,
    ) {
        warn!(policy_id, path = target_path, "discarding unapplied content");
        self.discard_object(policy_id, target_path).await;
        if let Some(version) = snapshot {
            self.discard_object(version.policy_id, &version.path).await;
        }
    }
}

/// Copy the current content of `node` to a fresh version path.
///
/// Returns `None` when the current content cannot be read or copied.
async fn snapshot(
    backend: &dyn StorageBackend,
    node: &FileNode,
    live_path: &str,
) -> Option<NewFileVersion> {
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let version_path = format!("{live_path}.v{stamp}");

    let mut current = match backend.get(live_path).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(file_id = node.id, "skipping version snapshot, content unreadable: {}", e);
            return None;
        }
    };
    if let Err(e) = backend
        .put(&version_path, &mut current, node.size as u64)
        .await
    {
        warn!(file_id = node.id, "skipping version snapshot, copy failed: {}", e);
        return None;
    }

    Some(NewFileVersion {
        file_id: node.id,
        size: node.size,
        path: version_path,
        hash: node.hash.clone().unwrap_or_default(),
        policy_id: node.policy_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::db::{Database, NewOwner, OwnerRepository};
    use crate::file::UploadRequest;
    use crate::storage::{LocalBackend, NewStoragePolicy, PolicyRepository, PolicyResolver};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn setup(total: i64) -> (TempDir, FileService, i64) {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        PolicyRepository::new(db.pool())
            .create(
                &NewStoragePolicy::local("local", temp.path().to_string_lossy().to_string())
                    .with_default(true),
            )
            .await
            .unwrap();
        let owner = OwnerRepository::new(db.pool())
            .create(&NewOwner::new("alice", total))
            .await
            .unwrap();
        let service = FileService::new(Arc::new(db), Arc::new(PolicyResolver::new()));
        (temp, service, owner.id)
    }

    async fn read(service: &FileService, owner: i64, id: i64) -> Vec<u8> {
        let mut opened = service.open(owner, id).await.unwrap();
        let mut out = Vec::new();
        opened.stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_edit_keeps_old_content_as_version() {
        let (temp, service, owner) = setup(1024).await;
        let node = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();

        let edited = service.edit_content(owner, node.id, b"second").await.unwrap();
        assert_eq!(edited.size, 6);
        assert_ne!(edited.path, node.path);
        assert_eq!(edited.hash.as_deref(), Some(sha256_hex(b"second").as_str()));
        assert_eq!(read(&service, owner, node.id).await, b"second");

        let versions = service.list_versions(owner, node.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].size, 3);
        assert_ne!(Some(&versions[0].path), node.path.as_ref());

        let local = LocalBackend::new(temp.path());
        assert!(local.exists(&versions[0].path).await.unwrap());
        // The replaced object had no other reference
        assert!(!local.exists(node.path.as_deref().unwrap()).await.unwrap());

        let used = OwnerRepository::new(service.pool())
            .get_by_id(owner)
            .await
            .unwrap()
            .unwrap()
            .used_size;
        assert_eq!(used, 6);
    }

    #[tokio::test]
    async fn test_restore_version() {
        let (_temp, service, owner) = setup(1024).await;
        let node = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();
        service.edit_content(owner, node.id, b"second").await.unwrap();

        let versions = service.list_versions(owner, node.id).await.unwrap();
        let restored = service.restore_version(owner, versions[0].id).await.unwrap();
        assert_eq!(restored.size, 3);
        assert_eq!(restored.hash, node.hash);
        assert_eq!(read(&service, owner, node.id).await, b"one");

        // The replaced content became a version too
        assert_eq!(service.list_versions(owner, node.id).await.unwrap().len(), 2);

        assert!(matches!(
            service.restore_version(owner + 1, versions[0].id).await,
            Err(HoardError::NotFound(_))
        ));
        assert!(matches!(
            service.restore_version(owner, 9999).await,
            Err(HoardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_over_quota_is_rejected_before_writing() {
        let (_temp, service, owner) = setup(8).await;
        let node = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();

        let result = service.edit_content(owner, node.id, b"far too long").await;
        assert!(matches!(result, Err(HoardError::QuotaExceeded { .. })));
        assert_eq!(read(&service, owner, node.id).await, b"one");
        assert!(service.list_versions(owner, node.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_shared_object_copies_on_write() {
        let (_temp, service, owner) = setup(1024).await;
        let original = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();
        let twin = service
            .upload(
                owner,
                &UploadRequest::new(0, "b.txt", 3).with_hash(original.hash.clone().unwrap()),
                &b"one"[..],
            )
            .await
            .unwrap();
        assert_eq!(twin.path, original.path);

        let edited = service.edit_content(owner, twin.id, b"two!").await.unwrap();
        assert_ne!(edited.path, original.path);
        assert_eq!(read(&service, owner, original.id).await, b"one");
        assert_eq!(read(&service, owner, twin.id).await, b"two!");
    }

    #[tokio::test]
    async fn test_edit_of_recycled_file_is_rejected_after_writing() {
        let (temp, service, owner) = setup(1024).await;
        let node = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();
        service.soft_delete(owner, node.id).await.unwrap();

        let mut reader = &b"two"[..];
        let replacement = Replacement {
            reader: &mut reader,
            size: 3,
            hash: sha256_hex(b"two"),
        };
        let result = service.replace_content(&node, replacement).await;
        assert!(matches!(result, Err(HoardError::NotFound(_))));

        // Only the recycled file's own object remains
        let mut remaining = 0;
        let mut dirs = vec![temp.path().to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    dirs.push(entry.path());
                } else {
                    remaining += 1;
                }
            }
        }
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_stale_edit_is_a_conflict() {
        let (_temp, service, owner) = setup(1024).await;
        let stale = service
            .upload(owner, &UploadRequest::new(0, "a.txt", 3), &b"one"[..])
            .await
            .unwrap();
        service.edit_content(owner, stale.id, b"two").await.unwrap();

        let mut reader = &b"three"[..];
        let replacement = Replacement {
            reader: &mut reader,
            size: 5,
            hash: sha256_hex(b"three"),
        };
        let err = service.replace_content(&stale, replacement).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert_eq!(read(&service, owner, stale.id).await, b"two");
    }

    #[tokio::test]
    async fn test_edit_folder_rejected() {
        let (_temp, service, owner) = setup(1024).await;
        let folder = service.create_folder(owner, 0, "docs").await.unwrap();
        assert!(matches!(
            service.edit_content(owner, folder.id, b"x").await,
            Err(HoardError::Validation(_))
        ));
    }
}
