//! File node types and repository.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};

use super::extension_of;
use crate::{HoardError, Result};

/// A node in an owner's namespace: a folder or a file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileNode {
    /// Node ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Size in bytes (0 for folders).
    pub size: i64,
    /// SHA-256 hex digest of the content (None for folders).
    pub hash: Option<String>,
    /// Storage-relative path of the physical object (None for folders).
    pub path: Option<String>,
    /// Extension including the dot, or empty.
    pub ext: String,
    /// Whether this node is a folder.
    pub is_folder: bool,
    /// Parent node ID (0 = root).
    pub parent_id: i64,
    /// Owning owner ID.
    pub owner_id: i64,
    /// Storage policy holding the content (0 for folders).
    pub policy_id: i64,
    /// Favorite flag.
    pub is_favorite: bool,
    /// Set once the node is in the recycle bin.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl FileNode {
    /// Whether the node is live (not in the recycle bin).
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Storage path of a file node.
    pub fn content_path(&self) -> Result<&str> {
        self.path
            .as_deref()
            .filter(|_| !self.is_folder)
            .ok_or_else(|| HoardError::Validation(format!("{} is not a file", self.name)))
    }
}

/// Data for creating a new node.
#[derive(Debug, Clone)]
pub struct NewFileNode {
    pub name: String,
    pub size: i64,
    pub hash: Option<String>,
    pub path: Option<String>,
    pub ext: String,
    pub is_folder: bool,
    pub parent_id: i64,
    pub owner_id: i64,
    pub policy_id: i64,
}

impl NewFileNode {
    /// A new folder.
    pub fn folder(owner_id: i64, parent_id: i64, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            hash: None,
            path: None,
            ext: String::new(),
            is_folder: true,
            parent_id,
            owner_id,
            policy_id: 0,
        }
    }

    /// A new file pointing at an existing physical object.
    pub fn file(
        owner_id: i64,
        parent_id: i64,
        name: impl Into<String>,
        size: i64,
        hash: impl Into<String>,
        path: impl Into<String>,
        policy_id: i64,
    ) -> Self {
        let name = name.into();
        Self {
            ext: extension_of(&name),
            name,
            size,
            hash: Some(hash.into()),
            path: Some(path.into()),
            is_folder: false,
            parent_id,
            owner_id,
            policy_id,
        }
    }

    /// A copy of `node` under a different owner and parent.
    pub fn copy_of(node: &FileNode, owner_id: i64, parent_id: i64) -> Self {
        Self {
            name: node.name.clone(),
            size: node.size,
            hash: node.hash.clone(),
            path: node.path.clone(),
            ext: node.ext.clone(),
            is_folder: node.is_folder,
            parent_id,
            owner_id,
            policy_id: node.policy_id,
        }
    }
}

const NODE_COLUMNS: &str = "id, name, size, hash, path, ext, is_folder, parent_id, owner_id, \
     policy_id, is_favorite, deleted_at, created_at, updated_at";

fn db_err(e: sqlx::Error) -> HoardError {
    HoardError::Database(e.to_string())
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Queries over the `files` table.
///
/// Every function takes an executor so the same statement can run against
/// the pool or inside a caller's transaction.
pub struct FileNodeRepository;

impl FileNodeRepository {
    /// Insert a node and return it.
    pub async fn insert<'e, E>(executor: E, node: &NewFileNode) -> Result<FileNode>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now();
        sqlx::query_as::<_, FileNode>(&format!(
            "INSERT INTO files (name, size, hash, path, ext, is_folder, parent_id, owner_id,
                                policy_id, is_favorite, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(&node.name)
        .bind(node.size)
        .bind(&node.hash)
        .bind(&node.path)
        .bind(&node.ext)
        .bind(node.is_folder)
        .bind(node.parent_id)
        .bind(node.owner_id)
        .bind(node.policy_id)
        .bind(now)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(db_err)
    }

    /// Get a node by ID regardless of owner or state.
    pub async fn get_by_id<'e, E>(executor: E, id: i64) -> Result<Option<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Get a node owned by `owner_id`, live or recycled.
    pub async fn get_owned<'e, E>(executor: E, owner_id: i64, id: i64) -> Result<Option<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Get a live node owned by `owner_id`.
    pub async fn get_live<'e, E>(executor: E, owner_id: i64, id: i64) -> Result<Option<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE id = ? AND owner_id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Live direct children of `parent_id`.
    pub async fn list_children<'e, E>(
        executor: E,
        owner_id: i64,
        parent_id: i64,
    ) -> Result<Vec<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE owner_id = ? AND parent_id = ? AND deleted_at IS NULL
             ORDER BY id"
        ))
        .bind(owner_id)
        .bind(parent_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Direct children of `parent_id` in any state.
    pub async fn list_children_any_state<'e, E>(
        executor: E,
        owner_id: i64,
        parent_id: i64,
    ) -> Result<Vec<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE owner_id = ? AND parent_id = ?
             ORDER BY id"
        ))
        .bind(owner_id)
        .bind(parent_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Recycled nodes of an owner, most recently deleted first.
    pub async fn list_recycled<'e, E>(executor: E, owner_id: i64) -> Result<Vec<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE owner_id = ? AND deleted_at IS NOT NULL
             ORDER BY deleted_at DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// IDs of recycled nodes deleted strictly before `cutoff`, across owners.
    pub async fn list_recycled_before<'e, E>(
        executor: E,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM files
             WHERE deleted_at IS NOT NULL AND deleted_at < ?
             ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Live favorite nodes of an owner.
    pub async fn list_favorites<'e, E>(executor: E, owner_id: i64) -> Result<Vec<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE owner_id = ? AND is_favorite = 1 AND deleted_at IS NULL
             ORDER BY id"
        ))
        .bind(owner_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Live nodes whose name contains `keyword` literally.
    pub async fn search<'e, E>(executor: E, owner_id: i64, keyword: &str) -> Result<Vec<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let pattern = format!("%{}%", escape_like(keyword));
        sqlx::query_as::<_, FileNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM files
             WHERE owner_id = ? AND deleted_at IS NULL AND name LIKE ? ESCAPE '\\'
             ORDER BY id"
        ))
        .bind(owner_id)
        .bind(pattern)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Move a live node into the recycle bin.
    ///
    /// Returns false if no live node matched.
    pub async fn mark_deleted<'e, E>(
        executor: E,
        owner_id: i64,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files SET deleted_at = ?
             WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .bind(owner_id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Bring a recycled node back under `parent_id`.
    ///
    /// Returns false if no recycled node matched.
    pub async fn clear_deleted<'e, E>(
        executor: E,
        owner_id: i64,
        id: i64,
        parent_id: i64,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files SET deleted_at = NULL, parent_id = ?
             WHERE id = ? AND owner_id = ? AND deleted_at IS NOT NULL",
        )
        .bind(parent_id)
        .bind(id)
        .bind(owner_id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Rename a live node.
    pub async fn rename<'e, E>(executor: E, owner_id: i64, id: i64, name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files
             SET name = ?, ext = CASE WHEN is_folder = 1 THEN '' ELSE ? END, updated_at = ?
             WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
        )
        .bind(name)
        .bind(extension_of(name))
        .bind(Utc::now())
        .bind(id)
        .bind(owner_id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Re-parent a live node.
    pub async fn set_parent<'e, E>(
        executor: E,
        owner_id: i64,
        id: i64,
        parent_id: i64,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files SET parent_id = ?, updated_at = ?
             WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
        )
        .bind(parent_id)
        .bind(Utc::now())
        .bind(id)
        .bind(owner_id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Flip the favorite flag of a live node and return the new value.
    pub async fn toggle_favorite<'e, E>(executor: E, owner_id: i64, id: i64) -> Result<Option<bool>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, bool>(
            "UPDATE files SET is_favorite = 1 - is_favorite
             WHERE id = ? AND owner_id = ? AND deleted_at IS NULL
             RETURNING is_favorite",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Point a live file node at new content.
    ///
    /// Only succeeds while the node still references `expected_path`.
    pub async fn update_content<'e, E>(
        executor: E,
        id: i64,
        expected_path: &str,
        size: i64,
        hash: &str,
        path: &str,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files SET size = ?, hash = ?, path = ?, updated_at = ?
             WHERE id = ? AND is_folder = 0 AND deleted_at IS NULL AND path = ?",
        )
        .bind(size)
        .bind(hash)
        .bind(path)
        .bind(Utc::now())
        .bind(id)
        .bind(expected_path)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a node record. Returns false if it was already gone.
    pub async fn delete<'e, E>(executor: E, id: i64) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}
