//! Owner records and their quota fields.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{HoardError, Result};

/// An owner of file nodes, carrying the quota ledger fields.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Owner {
    /// Owner ID.
    pub id: i64,
    /// Unique username.
    pub username: String,
    /// Total allotted bytes.
    pub total_size: i64,
    /// Bytes currently charged to this owner.
    pub used_size: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Owner {
    /// Bytes still available under the quota.
    pub fn available(&self) -> i64 {
        (self.total_size - self.used_size).max(0)
    }
}

/// Data for creating a new owner.
#[derive(Debug, Clone)]
pub struct NewOwner {
    /// Unique username.
    pub username: String,
    /// Total allotted bytes.
    pub total_size: i64,
}

impl NewOwner {
    /// Create a new owner with the given quota.
    pub fn new(username: impl Into<String>, total_size: i64) -> Self {
        Self {
            username: username.into(),
            total_size,
        }
    }
}

/// Repository for owner operations.
pub struct OwnerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OwnerRepository<'a> {
    /// Create a new OwnerRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new owner with zero used bytes.
    pub async fn create(&self, new_owner: &NewOwner) -> Result<Owner> {
        if new_owner.username.trim().is_empty() {
            return Err(HoardError::Validation("username is empty".to_string()));
        }
        if new_owner.total_size < 0 {
            return Err(HoardError::Validation(
                "total size must not be negative".to_string(),
            ));
        }

        let result = sqlx::query(
            "INSERT INTO owners (username, total_size, used_size, created_at)
             VALUES (?, ?, 0, ?)",
        )
        .bind(&new_owner.username)
        .bind(new_owner.total_size)
        .bind(Utc::now())
        .execute(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        let id = result.last_insert_rowid();
        self.get_by_id(id)
            .await?
            .ok_or(HoardError::OwnerNotFound(id))
    }

    /// Get an owner by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Owner>> {
        let owner = sqlx::query_as::<_, Owner>(
            "SELECT id, username, total_size, used_size, created_at FROM owners WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        Ok(owner)
    }

    /// Get an owner by username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<Owner>> {
        let owner = sqlx::query_as::<_, Owner>(
            "SELECT id, username, total_size, used_size, created_at
             FROM owners WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        Ok(owner)
    }

    /// Change an owner's total allotment.
    ///
    /// Shrinking below the current usage is allowed; further growth is then
    /// rejected by the quota ledger until usage drops.
    pub async fn set_total_size(&self, id: i64, total_size: i64) -> Result<Owner> {
        if total_size < 0 {
            return Err(HoardError::Validation(
                "total size must not be negative".to_string(),
            ));
        }

        let result = sqlx::query("UPDATE owners SET total_size = ? WHERE id = ?")
            .bind(total_size)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(HoardError::OwnerNotFound(id));
        }

        self.get_by_id(id)
            .await?
            .ok_or(HoardError::OwnerNotFound(id))
    }
}
