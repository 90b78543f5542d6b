//! SQLite-backed durable store.
//!
//! Timestamps are stored as unix milliseconds. Advisory locks are lease rows
//! in `retry_locks`; a lease whose `expires_at_ms` has passed is free to be
//! taken over, so a crashed owner never holds a lock forever.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DurableStore, LeaseCondition, LockKey, StageUpdate, StoreResult};
use crate::core::{
    Document, DocumentTags, ErrorKind, PipelineErrorRecord, StageExecution, StageStatus,
};
use crate::errors::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        document_id TEXT PRIMARY KEY,
        stages TEXT NOT NULL,
        tags TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_executions (
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        stage_order INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        started_at_ms INTEGER,
        completed_at_ms INTEGER,
        progress_percent INTEGER,
        last_error_summary TEXT,
        PRIMARY KEY (document_id, stage_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        correlation_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        error_kind TEXT NOT NULL,
        resolution_notes TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_errors_document ON pipeline_errors (document_id)",
    r#"
    CREATE TABLE IF NOT EXISTS retry_locks (
        lock_key TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        owner TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )
    "#,
];

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn now_ms() -> i64 {
    dt_to_ms(Utc::now())
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn row_to_execution(row: &SqliteRow) -> StoreResult<StageExecution> {
    let status: String = row.try_get("status")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let started_at: Option<i64> = row.try_get("started_at_ms")?;
    let completed_at: Option<i64> = row.try_get("completed_at_ms")?;
    let progress: Option<i64> = row.try_get("progress_percent")?;

    Ok(StageExecution {
        document_id: row.try_get("document_id")?,
        stage_name: row.try_get("stage_name")?,
        status: StageStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("attempt_count {attempt_count}")))?,
        started_at: started_at.map(ms_to_dt).transpose()?,
        completed_at: completed_at.map(ms_to_dt).transpose()?,
        progress_percent: progress.map(|p| p.clamp(0, 100) as u8),
        last_error_summary: row.try_get("last_error_summary")?,
    })
}

fn row_to_error(row: &SqliteRow) -> StoreResult<PipelineErrorRecord> {
    let error_kind: String = row.try_get("error_kind")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(PipelineErrorRecord {
        correlation_id: row.try_get("correlation_id")?,
        document_id: row.try_get("document_id")?,
        stage_name: row.try_get("stage_name")?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StoreError::Corrupt(format!("retry_count {retry_count}")))?,
        error_kind: ErrorKind::from_str(&error_kind).map_err(StoreError::Corrupt)?,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: ms_to_dt(row.try_get("created_at_ms")?)?,
    })
}

/// SQLite implementation of [`DurableStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connects to `url` (e.g. `sqlite://docflow.db` or `sqlite::memory:`)
    /// and creates the schema if needed.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory database exists per connection, so it must not be pooled wider.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Wraps an existing pool. The schema must already exist or
    /// [`migrate`](Self::migrate) must be called.
    #[must_use]
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Creates tables and indexes if they do not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_document(&self, document: &Document) -> StoreResult<()> {
        let stages = serde_json::to_string(&document.stages)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tags = serde_json::to_string(&document.tags)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO documents (document_id, stages, tags, created_at_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(&document.id)
        .bind(stages)
        .bind(tags)
        .bind(dt_to_ms(document.created_at))
        .execute(&mut *tx)
        .await?;

        for (order, stage) in document.stages.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO stage_executions
                    (document_id, stage_name, stage_order, status, attempt_count)
                VALUES (?, ?, ?, ?, 0)
                "#,
            )
            .bind(&document.id)
            .bind(stage)
            .bind(order as i64)
            .bind(StageStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT document_id, stages, tags, created_at_ms FROM documents WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stages: String = row.try_get("stages")?;
        let tags: String = row.try_get("tags")?;
        Ok(Some(Document {
            id: row.try_get("document_id")?,
            stages: serde_json::from_str(&stages).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            tags: serde_json::from_str::<DocumentTags>(&tags)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            created_at: ms_to_dt(row.try_get("created_at_ms")?)?,
        }))
    }

    async fn get_stage(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> StoreResult<Option<StageExecution>> {
        let row = sqlx::query("SELECT * FROM stage_executions WHERE document_id = ? AND stage_name = ?")
            .bind(document_id)
            .bind(stage_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_stages(&self, document_id: &str) -> StoreResult<Vec<StageExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM stage_executions WHERE document_id = ? ORDER BY stage_order",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn update_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        update: &StageUpdate,
    ) -> StoreResult<bool> {
        if update.expected.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; update.expected.len()].join(", ");
        let live_lease = "SELECT 1 FROM retry_locks WHERE lock_key = ? AND expires_at_ms > ?";
        let lease_clause = match update.lease {
            LeaseCondition::Any => String::new(),
            LeaseCondition::Free => format!("AND NOT EXISTS ({live_lease})"),
            LeaseCondition::Held => format!("AND EXISTS ({live_lease})"),
            LeaseCondition::HeldBy(_) => format!("AND EXISTS ({live_lease} AND owner = ?)"),
        };
        let sql = format!(
            r#"
            UPDATE stage_executions SET
                status = ?,
                attempt_count = attempt_count + ?,
                started_at_ms = COALESCE(?, started_at_ms),
                completed_at_ms = COALESCE(?, completed_at_ms),
                progress_percent = COALESCE(?, progress_percent),
                last_error_summary = COALESCE(?, last_error_summary)
            WHERE document_id = ? AND stage_name = ? AND status IN ({placeholders})
            {lease_clause}
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(i64::from(update.increment_attempt))
            .bind(update.started_at.map(dt_to_ms))
            .bind(update.completed_at.map(dt_to_ms))
            .bind(update.progress_percent.map(i64::from))
            .bind(update.last_error_summary.as_deref())
            .bind(document_id)
            .bind(stage_name);
        for status in &update.expected {
            query = query.bind(status.as_str());
        }
        if update.lease != LeaseCondition::Any {
            query = query
                .bind(LockKey::new(document_id, stage_name).fingerprint())
                .bind(now_ms());
        }
        if let LeaseCondition::HeldBy(owner) = update.lease {
            query = query.bind(owner.to_string());
        }

        let result = query.execute(&self.pool).await?;
        debug!(
            document_id,
            stage = stage_name,
            status = %update.status,
            applied = result.rows_affected() == 1,
            "Conditional stage update"
        );
        Ok(result.rows_affected() == 1)
    }

    async fn list_running_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM stage_executions
            WHERE status = ? AND (started_at_ms IS NULL OR started_at_ms < ?)
            ORDER BY document_id, stage_order
            "#,
        )
        .bind(StageStatus::Running.as_str())
        .bind(dt_to_ms(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn append_error(&self, record: &PipelineErrorRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_errors
                (correlation_id, document_id, stage_name, retry_count, error_kind, resolution_notes, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.correlation_id)
        .bind(&record.document_id)
        .bind(&record.stage_name)
        .bind(i64::from(record.retry_count))
        .bind(record.error_kind.as_str())
        .bind(&record.resolution_notes)
        .bind(dt_to_ms(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_errors(&self, document_id: &str) -> StoreResult<Vec<PipelineErrorRecord>> {
        let rows = sqlx::query("SELECT * FROM pipeline_errors WHERE document_id = ? ORDER BY id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_error).collect()
    }

    async fn try_acquire_lock(
        &self,
        key: &LockKey,
        owner: Uuid,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO retry_locks (lock_key, document_id, stage_name, owner, expires_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at_ms = excluded.expires_at_ms
            WHERE retry_locks.expires_at_ms <= ?
            "#,
        )
        .bind(key.fingerprint())
        .bind(&key.document_id)
        .bind(&key.stage_name)
        .bind(owner.to_string())
        .bind(now.saturating_add(ttl_ms(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lock(&self, key: &LockKey, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE retry_locks SET expires_at_ms = ? WHERE lock_key = ? AND owner = ? AND expires_at_ms > ?",
        )
        .bind(now.saturating_add(ttl_ms(ttl)))
        .bind(key.fingerprint())
        .bind(owner.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &LockKey, owner: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM retry_locks WHERE lock_key = ? AND owner = ?")
            .bind(key.fingerprint())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn force_release_lock(&self, key: &LockKey) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM retry_locks WHERE lock_key = ?")
            .bind(key.fingerprint())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool> {
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM retry_locks WHERE lock_key = ? AND expires_at_ms > ?)",
        )
        .bind(key.fingerprint())
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;

        Ok(locked)
    }
}
