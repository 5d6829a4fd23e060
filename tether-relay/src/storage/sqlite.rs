//! SQLite store for call history and undelivered events.

use super::{unix_millis, CallHistorySink, CallRecord, DeliveryFailure, DeliveryFailureSink};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tether_types::{AckId, Group};

/// SQLite-backed sink for finished calls and exhausted deliveries.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    undelivered_ttl_secs: u64,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("undelivered_ttl_secs", &self.undelivered_ttl_secs)
            .finish_non_exhaustive()
    }
}

/// An undelivered event awaiting offline redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeliveredEvent {
    /// Emission id.
    pub ack_id: AckId,
    /// Event name.
    pub event_name: String,
    /// Group the emission targeted.
    pub target_group: Group,
    /// Payload as emitted.
    pub payload: serde_json::Value,
    /// Emissions made before giving up.
    pub attempts: u32,
    /// Unix milliseconds of the first emission.
    pub created_at_ms: u64,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub async fn new(path: &Path, undelivered_ttl_secs: u64) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self {
            pool,
            undelivered_ttl_secs,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory(undelivered_ttl_secs: u64) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self {
            pool,
            undelivered_ttl_secs,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                call_id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                owner_device_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                address TEXT NOT NULL,
                line_id TEXT,
                outcome TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                duration_secs INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS undelivered (
                ack_id TEXT PRIMARY KEY,
                event TEXT NOT NULL,
                target_group TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_calls_owner ON call_history(owner_user_id, started_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_undelivered_group ON undelivered(target_group)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_undelivered_expires ON undelivered(expires_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn current_timestamp() -> i64 {
        (unix_millis() / 1000) as i64
    }

    /// Undelivered events for a group, oldest first.
    pub async fn undelivered_for_group(
        &self,
        group: &Group,
        limit: u32,
    ) -> Result<Vec<UndeliveredEvent>, StorageError> {
        let rows = sqlx::query_as::<_, UndeliveredRow>(
            r#"
            SELECT ack_id, event, target_group, payload, attempts, created_at
            FROM undelivered
            WHERE target_group = ?1 AND expires_at > ?2
            ORDER BY created_at ASC
            LIMIT ?3
            "#,
        )
        .bind(group.to_string())
        .bind(Self::current_timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UndeliveredEvent::try_from).collect()
    }

    /// Forget an undelivered event once it has been redelivered elsewhere.
    pub async fn remove_undelivered(&self, ack_id: &AckId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM undelivered WHERE ack_id = ?1")
            .bind(ack_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove undelivered events past their TTL.
    ///
    /// Returns the number of rows deleted.
    pub async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM undelivered WHERE expires_at <= ?1")
            .bind(Self::current_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Rows in `undelivered`.
    pub async fn undelivered_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM undelivered")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Rows in `call_history`.
    pub async fn call_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn insert_undelivered(
        &self,
        failure: &DeliveryFailure,
        expires_at: i64,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&failure.payload)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO undelivered (ack_id, event, target_group, payload, attempts, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(ack_id) DO UPDATE SET attempts = ?5, expires_at = ?7
            "#,
        )
        .bind(failure.ack_id.to_string())
        .bind(&failure.event_name)
        .bind(failure.target_group.to_string())
        .bind(payload)
        .bind(failure.attempts as i64)
        .bind(failure.created_at_ms as i64)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CallHistorySink for SqliteStore {
    async fn record_call(&self, record: CallRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO call_history
                (call_id, owner_user_id, owner_device_id, direction, address, line_id,
                 outcome, started_at, duration_secs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(record.call_id.to_string())
        .bind(record.owner_user_id.as_str())
        .bind(record.owner_device_id.as_str())
        .bind(record.direction.to_string())
        .bind(&record.address)
        .bind(record.line_id.as_deref())
        .bind(record.outcome.to_string())
        .bind(record.started_at_ms as i64)
        .bind(record.duration_secs as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DeliveryFailureSink for SqliteStore {
    async fn report(&self, failure: DeliveryFailure) -> Result<(), StorageError> {
        let expires_at = Self::current_timestamp() + self.undelivered_ttl_secs as i64;
        self.insert_undelivered(&failure, expires_at).await
    }
}

/// Internal row type for undelivered queries.
#[derive(sqlx::FromRow)]
struct UndeliveredRow {
    ack_id: String,
    event: String,
    target_group: String,
    payload: String,
    attempts: i64,
    created_at: i64,
}

fn corrupt<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Corrupt(e.to_string())
}

impl TryFrom<UndeliveredRow> for UndeliveredEvent {
    type Error = StorageError;

    fn try_from(row: UndeliveredRow) -> Result<Self, Self::Error> {
        Ok(UndeliveredEvent {
            ack_id: row.ack_id.parse::<AckId>().map_err(corrupt)?,
            event_name: row.event,
            target_group: row.target_group.parse::<Group>().map_err(corrupt)?,
            payload: serde_json::from_str(&row.payload).map_err(corrupt)?,
            attempts: row.attempts as u32,
            created_at_ms: row.created_at as u64,
        })
    }
}
