use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::SchemaCatalog;

/// Snapshots kept per schema; older rows are pruned on save
const SNAPSHOTS_KEPT: i64 = 5;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// SQLite storage for the last good schema catalog snapshots
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            // Remove sqlite: or sqlite:// prefix
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// In-memory storage, used when no snapshot file is wanted
    pub async fn in_memory() -> StorageResult<Self> {
        let storage = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schema_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                catalog_json TEXT NOT NULL,
                retrieved_at TEXT NOT NULL,
                saved_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schema_snapshots_schema ON schema_snapshots(schema_name, id DESC)",
            [],
        )?;

        Ok(())
    }

    /// Persist a catalog snapshot and prune older ones for the same schema
    pub async fn save_snapshot(&self, catalog: &SchemaCatalog) -> StorageResult<()> {
        let catalog_json = serde_json::to_string(catalog)?;
        let db_conn = self.conn.lock().await;

        db_conn.execute(
            r#"
            INSERT INTO schema_snapshots (schema_name, version, catalog_json, retrieved_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            rusqlite::params![
                catalog.schema_name,
                catalog.version as i64,
                catalog_json,
                catalog.retrieved_at.to_rfc3339(),
            ],
        )?;

        db_conn.execute(
            r#"
            DELETE FROM schema_snapshots
            WHERE schema_name = ?1
                AND id NOT IN (
                    SELECT id FROM schema_snapshots WHERE schema_name = ?1 ORDER BY id DESC LIMIT ?2
                )
            "#,
            rusqlite::params![catalog.schema_name, SNAPSHOTS_KEPT],
        )?;

        Ok(())
    }

    /// Most recently saved snapshot of a schema
    pub async fn load_latest_snapshot(&self, schema_name: &str) -> StorageResult<Option<SchemaCatalog>> {
        let db_conn = self.conn.lock().await;
        let catalog_json: Option<String> = db_conn
            .query_row(
                "SELECT catalog_json FROM schema_snapshots WHERE schema_name = ?1 ORDER BY id DESC LIMIT 1",
                rusqlite::params![schema_name],
                |row| row.get(0),
            )
            .optional()?;

        match catalog_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn snapshot_count(&self, schema_name: &str) -> StorageResult<i64> {
        let db_conn = self.conn.lock().await;
        let count = db_conn.query_row(
            "SELECT COUNT(*) FROM schema_snapshots WHERE schema_name = ?1",
            rusqlite::params![schema_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
