//! SQLite-based persistence for the task queue
//!
//! The queue is stored as a single JSON document under a versioned key in a
//! small key-value table. A schema change gets a new key; documents under
//! old keys are left where they are and never read again.

use crate::error::StashError;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use stash_types::DownloadTask;
use std::path::Path;
use tracing::warn;

/// Key holding the current task queue document
pub const TASKS_KEY: &str = "stash_downloads_v1";

/// Where an unreadable queue document is set aside before it can be overwritten
pub const CORRUPT_TASKS_KEY: &str = "stash_downloads_v1.corrupt";

/// Database connection pool for queue persistence
#[derive(Clone, Debug)]
pub struct QueueDatabase {
    pool: SqlitePool,
}

impl QueueDatabase {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StashError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Read the raw value stored under `key`
    pub async fn read(&self, key: &str) -> Result<Option<String>, StashError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    /// Replace the value stored under `key`
    pub async fn write(&self, key: &str, value: &str) -> Result<(), StashError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All keys currently present, including orphaned ones
    pub async fn keys(&self) -> Result<Vec<String>, StashError> {
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    /// Load the task queue as stored, skipping records that no longer parse
    pub async fn load_tasks(&self) -> Result<Vec<DownloadTask>, StashError> {
        let Some(raw) = self.read(TASKS_KEY).await? else {
            return Ok(Vec::new());
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "Stored task queue is unreadable, moved to {} and starting empty: {}",
                    CORRUPT_TASKS_KEY, e
                );
                self.write(CORRUPT_TASKS_KEY, &raw).await?;
                return Ok(Vec::new());
            }
        };

        let mut tasks = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<DownloadTask>(value) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Dropping malformed task record: {}", e),
            }
        }

        Ok(tasks)
    }

    /// Write the full task queue
    pub async fn save_tasks(&self, tasks: &[DownloadTask]) -> Result<(), StashError> {
        let json = serde_json::to_string(tasks)?;
        self.write(TASKS_KEY, &json).await
    }
}
