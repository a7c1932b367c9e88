//! Atomic per-owner quota accounting.
//!
//! `used_size` is only ever changed by single conditional `UPDATE`
//! statements, never by reading it and writing it back, so two concurrent
//! operations on the same owner cannot lose an update.

use sqlx::{Executor, Sqlite, SqliteConnection};
use tracing::debug;

use crate::db::Owner;
use crate::{HoardError, Result};

fn db_err(e: sqlx::Error) -> HoardError {
    HoardError::Database(e.to_string())
}

/// Quota ledger operations.
pub struct QuotaLedger;

impl QuotaLedger {
    async fn load_owner<'e, E>(executor: E, owner_id: i64) -> Result<Owner>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Owner>(
            "SELECT id, username, total_size, used_size, created_at FROM owners WHERE id = ?",
        )
        .bind(owner_id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)?
        .ok_or(HoardError::OwnerNotFound(owner_id))
    }

    /// Read-only ceiling check, run before any physical write.
    ///
    /// Passing does not reserve anything; the authoritative check is
    /// [`QuotaLedger::reserve`] inside the committing transaction.
    pub async fn preflight<'e, E>(executor: E, owner_id: i64, bytes: i64) -> Result<Owner>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let owner = Self::load_owner(executor, owner_id).await?;
        if bytes > 0 && owner.used_size + bytes > owner.total_size {
            return Err(HoardError::QuotaExceeded {
                requested: bytes,
                available: owner.available(),
            });
        }
        Ok(owner)
    }

    /// Charge `bytes` to an owner if it fits under the ceiling.
    pub async fn reserve(conn: &mut SqliteConnection, owner_id: i64, bytes: i64) -> Result<()> {
        if bytes < 0 {
            return Err(HoardError::Validation(format!(
                "cannot reserve a negative amount: {bytes}"
            )));
        }

        let result = sqlx::query(
            "UPDATE owners SET used_size = used_size + ?
             WHERE id = ? AND used_size + ? <= total_size",
        )
        .bind(bytes)
        .bind(owner_id)
        .bind(bytes)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Either the owner is missing or the ceiling was hit
            let owner = Self::load_owner(&mut *conn, owner_id).await?;
            return Err(HoardError::QuotaExceeded {
                requested: bytes,
                available: owner.available(),
            });
        }

        debug!(owner_id, bytes, "reserved quota");
        Ok(())
    }

    /// Give `bytes` back to an owner. Never drops below zero.
    pub async fn release(conn: &mut SqliteConnection, owner_id: i64, bytes: i64) -> Result<()> {
        if bytes < 0 {
            return Err(HoardError::Validation(format!(
                "cannot release a negative amount: {bytes}"
            )));
        }

        let result = sqlx::query(
            "UPDATE owners SET used_size = MAX(used_size - ?, 0) WHERE id = ?",
        )
        .bind(bytes)
        .bind(owner_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(HoardError::OwnerNotFound(owner_id));
        }

        debug!(owner_id, bytes, "released quota");
        Ok(())
    }

    /// Apply a signed delta: growth is ceiling-checked, shrinkage is not.
    pub async fn apply_delta(conn: &mut SqliteConnection, owner_id: i64, delta: i64) -> Result<()> {
        if delta >= 0 {
            Self::reserve(conn, owner_id, delta).await
        } else {
            Self::release(conn, owner_id, -delta).await
        }
    }
}
