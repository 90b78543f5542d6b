//! Durable store abstraction.
//!
//! The orchestration core needs three things from its store:
//! - atomic conditional updates of a stage row keyed by (document, stage)
//! - an advisory lock with try-acquire semantics and lease-based expiry
//! - append-only inserts for error records
//!
//! [`InMemoryStore`] implements the contract in-process; [`SqliteStore`]
//! persists it with sqlx.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{Document, PipelineErrorRecord, StageExecution, StageStatus};
use crate::errors::StoreError;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// What an update requires of the stage's retry lease, checked atomically
/// with the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseCondition {
    /// The lease is not consulted.
    #[default]
    Any,
    /// No live lease may exist.
    Free,
    /// A live lease must exist, whoever holds it.
    Held,
    /// A live lease held by this owner must exist.
    HeldBy(Uuid),
}

impl LeaseCondition {
    /// Checks the condition against the owner of the live lease, if any.
    #[must_use]
    pub fn admits(&self, live_owner: Option<Uuid>) -> bool {
        match self {
            Self::Any => true,
            Self::Free => live_owner.is_none(),
            Self::Held => live_owner.is_some(),
            Self::HeldBy(owner) => live_owner == Some(*owner),
        }
    }
}

/// A compare-and-set update of one stage row.
///
/// The update applies only if the row's current status is one of
/// `expected` and the retry lease satisfies `lease`. Optional fields left
/// as `None` keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageUpdate {
    /// Statuses the row must currently be in.
    pub expected: Vec<StageStatus>,
    /// Condition on the stage's retry lease.
    pub lease: LeaseCondition,
    /// Status to write.
    pub status: StageStatus,
    /// Whether to increment `attempt_count`.
    pub increment_attempt: bool,
    /// New `started_at`.
    pub started_at: Option<DateTime<Utc>>,
    /// New `completed_at`.
    pub completed_at: Option<DateTime<Utc>>,
    /// New `progress_percent`.
    pub progress_percent: Option<u8>,
    /// New `last_error_summary`.
    pub last_error_summary: Option<String>,
}

impl StageUpdate {
    fn transition(expected: Vec<StageStatus>, status: StageStatus) -> Self {
        Self {
            expected,
            lease: LeaseCondition::Any,
            status,
            increment_attempt: false,
            started_at: None,
            completed_at: None,
            progress_percent: None,
            last_error_summary: None,
        }
    }

    /// `pending -> running`, counting a new attempt. Refused while a retry
    /// lease is live.
    #[must_use]
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            lease: LeaseCondition::Free,
            increment_attempt: true,
            started_at: Some(now),
            progress_percent: Some(0),
            ..Self::transition(vec![StageStatus::Pending], StageStatus::Running)
        }
    }

    /// `pending -> running` for the holder of the retry lease.
    #[must_use]
    pub fn resume(now: DateTime<Utc>, owner: Uuid) -> Self {
        Self::start(now).with_lease(LeaseCondition::HeldBy(owner))
    }

    /// Progress report on a running stage.
    #[must_use]
    pub fn progress(percent: u8) -> Self {
        Self {
            progress_percent: Some(percent.min(100)),
            ..Self::transition(vec![StageStatus::Running], StageStatus::Running)
        }
    }

    /// `running -> completed`.
    #[must_use]
    pub fn complete(now: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(now),
            progress_percent: Some(100),
            ..Self::transition(vec![StageStatus::Running], StageStatus::Completed)
        }
    }

    /// `running -> failed`.
    #[must_use]
    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            last_error_summary: Some(summary.into()),
            ..Self::transition(vec![StageStatus::Running], StageStatus::Failed)
        }
    }

    /// `running -> pending` while a retry is scheduled.
    #[must_use]
    pub fn reschedule(summary: impl Into<String>) -> Self {
        Self {
            last_error_summary: Some(summary.into()),
            progress_percent: Some(0),
            ..Self::transition(vec![StageStatus::Running], StageStatus::Pending)
        }
    }

    /// `pending -> skipped`.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            last_error_summary: Some(reason.into()),
            ..Self::transition(vec![StageStatus::Pending], StageStatus::Skipped)
        }
    }

    /// `running -> failed` with the given reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            last_error_summary: Some(reason.into()),
            ..Self::transition(vec![StageStatus::Running], StageStatus::Failed)
        }
    }

    /// `pending -> failed` for a stage waiting on a scheduled retry.
    #[must_use]
    pub fn cancel_scheduled(reason: impl Into<String>) -> Self {
        Self {
            last_error_summary: Some(reason.into()),
            lease: LeaseCondition::Held,
            ..Self::transition(vec![StageStatus::Pending], StageStatus::Failed)
        }
    }

    /// `running -> pending` for a row abandoned by a crashed scheduler.
    #[must_use]
    pub fn reclaim() -> Self {
        Self {
            last_error_summary: Some("reclaimed after stale run".to_string()),
            lease: LeaseCondition::Free,
            ..Self::transition(vec![StageStatus::Running], StageStatus::Pending)
        }
    }

    /// Replaces the lease condition.
    #[must_use]
    pub fn with_lease(mut self, lease: LeaseCondition) -> Self {
        self.lease = lease;
        self
    }

    /// Returns true if the update may apply to a row in `current`, ignoring
    /// the lease condition.
    #[must_use]
    pub fn matches(&self, current: StageStatus) -> bool {
        self.expected.contains(&current)
    }

    /// Applies the update to an in-memory row. Does not check `expected`.
    pub fn apply_to(&self, row: &mut StageExecution) {
        row.status = self.status;
        if self.increment_attempt {
            row.attempt_count += 1;
        }
        if let Some(started_at) = self.started_at {
            row.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            row.completed_at = Some(completed_at);
        }
        if let Some(progress) = self.progress_percent {
            row.progress_percent = Some(progress);
        }
        if let Some(ref summary) = self.last_error_summary {
            row.last_error_summary = Some(summary.clone());
        }
    }
}

/// Key of the advisory retry lock for one (document, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    /// Document identifier.
    pub document_id: String,
    /// Stage name.
    pub stage_name: String,
}

impl LockKey {
    /// Creates a new lock key.
    #[must_use]
    pub fn new(document_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            stage_name: stage_name.into(),
        }
    }

    /// Returns a fixed-width fingerprint of the key, used as the lock row id.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.document_id.len() as u64).to_le_bytes());
        hasher.update(self.document_id.as_bytes());
        hasher.update(self.stage_name.as_bytes());
        let digest = hasher.finalize();
        format!("lock:{}", hex::encode(&digest[..16]))
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.stage_name)
    }
}

/// Protocol for the durable store backing the orchestration core.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    /// Persists a document and one pending row per required stage.
    ///
    /// Idempotent: existing documents and rows are left untouched.
    async fn insert_document(&self, document: &Document) -> StoreResult<()>;

    /// Gets a document by id.
    async fn get_document(&self, document_id: &str) -> StoreResult<Option<Document>>;

    /// Gets one stage row.
    async fn get_stage(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> StoreResult<Option<StageExecution>>;

    /// Lists all stage rows of a document (in no particular order).
    async fn list_stages(&self, document_id: &str) -> StoreResult<Vec<StageExecution>>;

    /// Atomically applies `update` if the row's status matches.
    ///
    /// Returns false if the row is missing or in another status.
    async fn update_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        update: &StageUpdate,
    ) -> StoreResult<bool>;

    /// Lists running rows whose latest attempt started before `cutoff`.
    async fn list_running_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>>;

    /// Appends an error record.
    async fn append_error(&self, record: &PipelineErrorRecord) -> StoreResult<()>;

    /// Lists the error trail of a document in insertion order.
    async fn list_errors(&self, document_id: &str) -> StoreResult<Vec<PipelineErrorRecord>>;

    /// Tries to take the lock for `ttl`. Expired leases may be taken over.
    async fn try_acquire_lock(&self, key: &LockKey, owner: Uuid, ttl: Duration)
        -> StoreResult<bool>;

    /// Extends a lease still held by `owner`.
    async fn renew_lock(&self, key: &LockKey, owner: Uuid, ttl: Duration) -> StoreResult<bool>;

    /// Releases the lock if `owner` holds it.
    async fn release_lock(&self, key: &LockKey, owner: Uuid) -> StoreResult<bool>;

    /// Releases the lock whoever holds it.
    async fn force_release_lock(&self, key: &LockKey) -> StoreResult<bool>;

    /// Returns true if an unexpired lease exists for the key.
    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool>;
}
