//! libSQL-backed [`KvStore`].
//!
//! One table, `kv(key, value, expires_at)`. Expiry is a unix timestamp in
//! seconds; rows past it are invisible to reads and removed by
//! [`SqliteStore::purge_expired`].

use async_trait::async_trait;
use decent_auth::{KvStore, StoreError};
use libsql::{Connection, Database, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
";

pub struct SqliteStore {
    // Kept alive for the lifetime of the connection
    _db: Database,
    // In-memory databases are per-connection, so every query goes through one
    conn: Mutex<Connection>,
}

fn backend(e: libsql::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteStore {
    /// Open (or create) a database file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(backend)?;
        let store = Self::init(db).await?;
        info!("Opened store database at {:?}", path);
        Ok(store)
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(backend)?;
        Self::init(db).await
    }

    async fn init(db: Database) -> Result<Self, StoreError> {
        let conn = db.connect().map_err(backend)?;
        conn.execute_batch(SCHEMA).await.map_err(backend)?;
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    /// Delete every expired row. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                vec![Value::Integer(now())],
            )
            .await
            .map_err(backend)?;
        if removed > 0 {
            debug!(removed, "Purged expired store rows");
        }
        Ok(removed)
    }

    async fn upsert(&self, key: &str, value: Vec<u8>, expires_at: Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            vec![Value::Text(key.to_string()), Value::Blob(value), expires_at],
        )
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                vec![Value::Text(key.to_string()), Value::Integer(now())],
            )
            .await
            .map_err(backend)?;

        match rows.next().await.map_err(backend)? {
            Some(row) => Ok(Some(row.get::<Vec<u8>>(0).map_err(backend)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.upsert(key, value, Value::Null).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now().saturating_add(ttl);
        self.upsert(key, value, Value::Integer(expires_at)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT key FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
                vec![Value::Text(prefix.to_string()), Value::Integer(now())],
            )
            .await
            .map_err(backend)?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend)? {
            keys.push(row.get::<String>(0).map_err(backend)?);
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE key = ?1",
            vec![Value::Text(key.to_string())],
        )
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "DELETE FROM kv WHERE key = ?1 RETURNING value, expires_at",
                vec![Value::Text(key.to_string())],
            )
            .await
            .map_err(backend)?;

        let Some(row) = rows.next().await.map_err(backend)? else {
            return Ok(None);
        };
        let value = row.get::<Vec<u8>>(0).map_err(backend)?;
        let expires_at = row.get::<Option<i64>>(1).map_err(backend)?;

        match expires_at {
            Some(at) if at <= now() => Ok(None),
            _ => Ok(Some(value)),
        }
    }
}
