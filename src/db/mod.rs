//! Database module for Hoard.
//!
//! This module provides SQLite connectivity through sqlx and migration management.

mod owner;
mod schema;

pub use owner::{NewOwner, Owner, OwnerRepository};
pub use schema::MIGRATIONS;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::{HoardError, Result};

/// Connection pool type used throughout the crate.
pub type DbPool = SqlitePool;

/// Database wrapper for managing the SQLite pool and migrations.
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open a database at the specified path with the default pool size.
    ///
    /// If the database file doesn't exist, it will be created.
    /// Migrations are automatically applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, 5).await
    }

    /// Open a database at the specified path with `max_connections` pooled connections.
    pub async fn open_with(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Open an in-memory database for testing.
    ///
    /// The pool holds exactly one connection that never expires, so the
    /// in-memory database lives as long as the pool.
    pub async fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory database");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| HoardError::Database(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Begin a write transaction.
    ///
    /// The write lock is taken up front with `BEGIN IMMEDIATE`, so concurrent
    /// writers wait on the busy timeout instead of failing when a read lock
    /// would have to be upgraded.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| HoardError::Database(e.to_string()))
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        if !self.table_exists("schema_version").await? {
            return Ok(0);
        }

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| HoardError::Database(e.to_string()))?;

        Ok(version)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version().await?;
        let migrations = MIGRATIONS;

        if current_version as usize >= migrations.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            migrations.len()
        );

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     INTEGER PRIMARY KEY,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        // Apply each pending migration in a transaction
        for (i, migration) in migrations.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            info!("Applying migration v{}", version);

            let mut tx = self.begin().await?;

            sqlx::raw_sql(migration)
                .execute(&mut *tx)
                .await
                .map_err(|e| HoardError::Database(format!("migration v{version}: {e}")))?;

            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(|e| HoardError::Database(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| HoardError::Database(e.to_string()))?;
            debug!("Migration v{} applied successfully", version);
        }

        info!(
            "Database migration complete (now at version {})",
            migrations.len()
        );
        Ok(())
    }

    /// Check if a table exists.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
        )
        .bind(table_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;
        Ok(exists)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.schema_version().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_migrations_applied() {
        let db = Database::open_in_memory().await.unwrap();
        let version = db.schema_version().await.unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_tables_exist() {
        let db = Database::open_in_memory().await.unwrap();

        for table in ["owners", "storage_policies", "files", "file_versions"] {
            assert!(db.table_exists(table).await.unwrap(), "missing {table}");
        }
        assert!(db.table_exists("schema_version").await.unwrap());
        assert!(!db.table_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::open_in_memory().await.unwrap();

        let fk_enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let db = Database::open_in_memory().await.unwrap();

        {
            let mut tx = db.begin().await.unwrap();
            sqlx::query(
                "INSERT INTO owners (username, total_size, used_size, created_at)
                 VALUES ('rollback', 10, 0, '2024-01-01T00:00:00Z')",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
            // Dropped without commit
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM owners")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_write_transactions_wait_for_each_other() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(Database::open(temp_dir.path().join("w.db")).await.unwrap());
        sqlx::query(
            "INSERT INTO owners (username, total_size, used_size, created_at)
             VALUES ('counter', 1000, 0, '2024-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        // Read then write inside each transaction, the pattern every mutation follows
        let mut handles = Vec::new();
        for _ in 0..20 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = db.begin().await?;
                let used: i64 =
                    sqlx::query_scalar("SELECT used_size FROM owners WHERE username = 'counter'")
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| HoardError::Database(e.to_string()))?;
                sqlx::query("UPDATE owners SET used_size = ? WHERE username = 'counter'")
                    .bind(used + 1)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| HoardError::Database(e.to_string()))?;
                tx.commit()
                    .await
                    .map_err(|e| HoardError::Database(e.to_string()))
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let used: i64 =
            sqlx::query_scalar("SELECT used_size FROM owners WHERE username = 'counter'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(used, 20);
        db.close().await;
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        {
            let db = Database::open(&db_path).await.unwrap();
            assert!(db.table_exists("files").await.unwrap());
            db.close().await;
        }

        // Reopen: migrations are not reapplied
        let db = Database::open(&db_path).await.unwrap();
        assert_eq!(
            db.schema_version().await.unwrap() as usize,
            MIGRATIONS.len()
        );
        db.close().await;
    }
}
