//! SQLite-backed timeout store
//!
//! The durable variant of the timeout manager: deferred envelopes survive
//! process restarts. Queries are issued at runtime against an embedded
//! SQLite database; the schema is created on connect.

use super::{DueMessage, TimeoutManager};
use crate::errors::{BusError, BusResult};
use crate::time_provider::SharedTimeProvider;
use crate::transport::headers::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// SQL statements for the timeout schema
mod sql {
    pub(super) fn create_timeouts_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS timeouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            due_time_ms INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL
        )"
    }

    pub(super) fn create_due_time_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_timeouts_due_time ON timeouts (due_time_ms)"
    }

    pub(super) fn insert_timeout() -> &'static str {
        "INSERT INTO timeouts (due_time_ms, headers, body) VALUES (?, ?, ?)"
    }

    pub(super) fn select_due() -> &'static str {
        "SELECT id, headers, body FROM timeouts WHERE due_time_ms <= ? ORDER BY due_time_ms, id"
    }

    pub(super) fn delete_by_id() -> &'static str {
        "DELETE FROM timeouts WHERE id = ?"
    }

    pub(super) fn count_pending() -> &'static str {
        "SELECT COUNT(*) AS pending FROM timeouts"
    }
}

fn storage_error(source: impl std::error::Error + Send + Sync + 'static) -> BusError {
    BusError::Storage {
        context: "timeout",
        source: Box::new(source),
    }
}

/// Durable timeout store over an embedded SQLite database
#[derive(Clone)]
pub struct SqliteTimeoutStore {
    pool: SqlitePool,
    time: SharedTimeProvider,
}

impl SqliteTimeoutStore {
    /// Opens (creating if needed) the database at the given path and
    /// ensures the schema exists
    pub async fn connect(path: &Path, time: SharedTimeProvider) -> BusResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await.map_err(storage_error)?;
        Self::with_pool(pool, time).await
    }

    /// Wraps an existing pool, ensuring the schema exists
    pub async fn with_pool(pool: SqlitePool, time: SharedTimeProvider) -> BusResult<Self> {
        sqlx::query(sql::create_timeouts_table())
            .execute(&pool)
            .await
            .map_err(storage_error)?;
        sqlx::query(sql::create_due_time_index())
            .execute(&pool)
            .await
            .map_err(storage_error)?;
        Ok(Self { pool, time })
    }

    /// Number of envelopes currently parked
    pub async fn pending_count(&self) -> BusResult<u64> {
        let row = sqlx::query(sql::count_pending())
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        let pending: i64 = row.get("pending");
        Ok(pending as u64)
    }
}

#[async_trait]
impl TimeoutManager for SqliteTimeoutStore {
    async fn defer(&self, due: DateTime<Utc>, headers: Headers, body: Bytes) -> BusResult<()> {
        let headers_json = serde_json::to_string(&headers).map_err(storage_error)?;
        sqlx::query(sql::insert_timeout())
            .bind(due.timestamp_millis())
            .bind(headers_json)
            .bind(body.to_vec())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        debug!(due = %due, "deferred envelope stored");
        Ok(())
    }

    async fn due_messages(&self) -> BusResult<Vec<Arc<dyn DueMessage>>> {
        let now = self.time.now().timestamp_millis();
        let rows = sqlx::query(sql::select_due())
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let headers_json: String = row.get("headers");
            let body: Vec<u8> = row.get("body");
            let headers: Headers = serde_json::from_str(&headers_json).map_err(storage_error)?;
            due.push(Arc::new(SqliteDueMessage {
                pool: self.pool.clone(),
                id,
                headers,
                body: Bytes::from(body),
            }) as Arc<dyn DueMessage>);
        }
        Ok(due)
    }
}

impl std::fmt::Debug for SqliteTimeoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTimeoutStore").finish_non_exhaustive()
    }
}

struct SqliteDueMessage {
    pool: SqlitePool,
    id: i64,
    headers: Headers,
    body: Bytes,
}

#[async_trait]
impl DueMessage for SqliteDueMessage {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    async fn mark_as_processed(&self) -> anyhow::Result<()> {
        sqlx::query(sql::delete_by_id())
            .bind(self.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
