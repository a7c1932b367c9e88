//! File version snapshots.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};

use crate::{HoardError, Result};

/// An immutable snapshot of a file's earlier content.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileVersion {
    /// Version ID.
    pub id: i64,
    /// File node this version belongs to.
    pub file_id: i64,
    /// Size in bytes.
    pub size: i64,
    /// Storage path of the snapshot, distinct from the live path.
    pub path: String,
    /// SHA-256 hex digest of the snapshot.
    pub hash: String,
    /// Storage policy holding the snapshot.
    pub policy_id: i64,
    /// Snapshot time.
    pub created_at: DateTime<Utc>,
}

/// Data for recording a new version.
#[derive(Debug, Clone)]
pub struct NewFileVersion {
    pub file_id: i64,
    pub size: i64,
    pub path: String,
    pub hash: String,
    pub policy_id: i64,
}

const VERSION_COLUMNS: &str = "id, file_id, size, path, hash, policy_id, created_at";

fn db_err(e: sqlx::Error) -> HoardError {
    HoardError::Database(e.to_string())
}

/// Queries over the `file_versions` table.
pub struct FileVersionRepository;

impl FileVersionRepository {
    /// Record a version.
    pub async fn insert<'e, E>(executor: E, version: &NewFileVersion) -> Result<FileVersion>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileVersion>(&format!(
            "INSERT INTO file_versions (file_id, size, path, hash, policy_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(version.file_id)
        .bind(version.size)
        .bind(&version.path)
        .bind(&version.hash)
        .bind(version.policy_id)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
        .map_err(db_err)
    }

    /// Get a version by ID.
    pub async fn get_by_id<'e, E>(executor: E, id: i64) -> Result<Option<FileVersion>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Versions of a file, newest first.
    pub async fn list_by_file<'e, E>(executor: E, file_id: i64) -> Result<Vec<FileVersion>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions
             WHERE file_id = ?
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(file_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }

    /// Delete every version of a file and return the removed rows.
    pub async fn delete_by_file<'e, E>(executor: E, file_id: i64) -> Result<Vec<FileVersion>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileVersion>(&format!(
            "DELETE FROM file_versions WHERE file_id = ? RETURNING {VERSION_COLUMNS}"
        ))
        .bind(file_id)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }
}
