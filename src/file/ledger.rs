//! Hash lookups and physical object reference counts.
//!
//! There is no explicit reference counter: the number of nodes pointing at a
//! `(policy, path)` pair is derived by query when it matters.

use sqlx::{Executor, Sqlite};

use super::node::FileNode;
use crate::{HoardError, Result};

/// Content ledger queries.
pub struct ContentLedger;

impl ContentLedger {
    /// A live file whose content has the given hash, if any.
    pub async fn find_live_by_hash<'e, E>(executor: E, hash: &str) -> Result<Option<FileNode>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, FileNode>(
            "SELECT id, name, size, hash, path, ext, is_folder, parent_id, owner_id,
                    policy_id, is_favorite, deleted_at, created_at, updated_at
             FROM files
             WHERE hash = ? AND is_folder = 0 AND deleted_at IS NULL AND path IS NOT NULL
             ORDER BY id
             LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(executor)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))
    }

    /// Number of nodes, live or recycled, referencing a physical object.
    pub async fn reference_count<'e, E>(executor: E, policy_id: i64, path: &str) -> Result<i64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM files WHERE policy_id = ? AND path = ? AND is_folder = 0",
        )
        .bind(policy_id)
        .bind(path)
        .fetch_one(executor)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))
    }
}
