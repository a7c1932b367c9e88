//! Streaming ZIP export of files and folders.
//!
//! Each file is copied from its backend straight into its archive entry, so
//! only one copy buffer is held at a time. Unreadable files are skipped and
//! reported in the [`ExportManifest`]; a failing sink aborts the export.
//! A file whose read fails after its entry was started keeps the truncated
//! entry, followed by an empty `<name>.partial` marker entry.

use std::collections::HashSet;

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipDateTime, ZipEntryBuilder};
use futures::AsyncWriteExt as _;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::node::{FileNode, FileNodeRepository};
use super::service::FileService;
use super::MAX_TREE_DEPTH;
use crate::storage::COPY_BUF_SIZE;
use crate::{HoardError, Result};

/// A file left out of an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Node ID that was requested or encountered.
    pub id: i64,
    /// Archive path the file would have had, or empty if unknown.
    pub name: String,
    /// Why it was skipped.
    pub reason: String,
}

/// What an export wrote and what it left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportManifest {
    /// Archive paths of the complete entries, in archive order.
    pub entries: Vec<String>,
    /// Files that could not be exported.
    pub skipped: Vec<SkippedEntry>,
}

/// Suffix of the empty marker entry written after a truncated entry.
pub const PARTIAL_SUFFIX: &str = ".partial";

fn archive_err(e: async_zip::error::ZipError) -> HoardError {
    HoardError::Archive(e.to_string())
}

/// Make `name` unique among archive paths already used.
///
/// `a.txt` becomes `a (1).txt`, then `a (2).txt`.
fn unique_name(used: &mut HashSet<String>, name: String) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 && !name[..i].ends_with('/') => (&name[..i], &name[i..]),
        _ => (name.as_str(), ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

impl FileService {
    /// Write the given files and folders into a ZIP archive on `sink`.
    ///
    /// Folders are walked recursively and their files are named
    /// `Folder/Sub/file.txt`. Recycled nodes are not exported.
    pub async fn batch_export<W>(&self, owner_id: i64, ids: &[i64], sink: W) -> Result<ExportManifest>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut manifest = ExportManifest::default();
        let mut used = HashSet::new();
        let leaves = self
            .collect_leaves(owner_id, ids, &mut used, &mut manifest)
            .await?;

        let mut writer = ZipFileWriter::with_tokio(sink);
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        for (name, node) in leaves {
            // The first chunk is read before the entry exists, so a file that
            // cannot be read at all leaves no trace in the archive
            let first = match self.open_node(&node).await {
                Ok(mut stream) => match stream.read(&mut buf).await {
                    Ok(n) => Ok((stream, n)),
                    Err(e) => Err(HoardError::from(e)),
                },
                Err(e) => Err(e),
            };
            let (mut stream, mut n) = match first {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(file_id = node.id, "skipping export entry: {}", e);
                    manifest.skipped.push(SkippedEntry {
                        id: node.id,
                        name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let builder = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate)
                .last_modification_date(ZipDateTime::from_chrono(&node.updated_at));
            let mut entry = writer
                .write_entry_stream(builder)
                .await
                .map_err(archive_err)?;

            let mut read_error = None;
            while n > 0 {
                entry
                    .write_all(&buf[..n])
                    .await
                    .map_err(|e| HoardError::Archive(format!("{name}: {e}")))?;
                n = match stream.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                };
            }
            entry.close().await.map_err(archive_err)?;

            let Some(e) = read_error else {
                debug!(file_id = node.id, entry = %name, "exported file");
                manifest.entries.push(name);
                continue;
            };

            // Entries cannot be renamed once streamed; flag the truncated one
            // with an empty marker beside it
            let marker = unique_name(&mut used, format!("{name}{PARTIAL_SUFFIX}"));
            let builder = ZipEntryBuilder::new(marker.clone().into(), Compression::Stored)
                .last_modification_date(ZipDateTime::from_chrono(&node.updated_at));
            writer
                .write_entry_whole(builder, &[])
                .await
                .map_err(archive_err)?;

            warn!(
                file_id = node.id,
                entry = %name,
                marker = %marker,
                "export entry truncated: {}",
                e
            );
            manifest.skipped.push(SkippedEntry {
                id: node.id,
                name,
                reason: format!("read failed mid-stream: {e}"),
            });
        }

        let mut sink = writer.close().await.map_err(archive_err)?.into_inner();
        sink.flush().await?;

        info!(
            owner_id,
            entries = manifest.entries.len(),
            skipped = manifest.skipped.len(),
            "batch export finished"
        );
        Ok(manifest)
    }

    async fn open_node(&self, node: &FileNode) -> Result<crate::storage::ByteStream> {
        let (_, backend) = self.backend_for(node.policy_id).await?;
        backend.get(node.content_path()?).await
    }

    /// Resolve requested ids into `(archive path, file)` pairs.
    async fn collect_leaves(
        &self,
        owner_id: i64,
        ids: &[i64],
        used: &mut HashSet<String>,
        manifest: &mut ExportManifest,
    ) -> Result<Vec<(String, FileNode)>> {
        let mut leaves = Vec::new();

        for &id in ids {
            let Some(node) = FileNodeRepository::get_live(self.pool(), owner_id, id).await? else {
                manifest.skipped.push(SkippedEntry {
                    id,
                    name: String::new(),
                    reason: "not found".to_string(),
                });
                continue;
            };

            if !node.is_folder {
                let name = unique_name(used, node.name.clone());
                leaves.push((name, node));
                continue;
            }

            // Depth-first walk keeping each folder's accumulated prefix
            let root = unique_name(used, node.name.clone());
            let mut pending = vec![(root, node.id, 0usize)];
            while let Some((prefix, folder_id, depth)) = pending.pop() {
                if depth >= MAX_TREE_DEPTH {
                    return Err(HoardError::Validation(format!(
                        "folder nesting deeper than {MAX_TREE_DEPTH}"
                    )));
                }
                let children =
                    FileNodeRepository::list_children(self.pool(), owner_id, folder_id).await?;
                for child in children.into_iter().rev() {
                    let path = format!("{prefix}/{}", child.name);
                    if child.is_folder {
                        pending.push((path, child.id, depth + 1));
                    } else {
                        let name = unique_name(used, path);
                        leaves.push((name, child));
                    }
                }
            }
        }

        Ok(leaves)
    }
}
