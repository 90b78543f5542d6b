//! In-memory durable store.
//!
//! Durable only for the lifetime of the process. Every operation takes a
//! single mutex, which makes each conditional update atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{DurableStore, LockKey, StageUpdate, StoreResult};
use crate::core::{Document, PipelineErrorRecord, StageExecution, StageStatus};

#[derive(Debug)]
struct Lease {
    owner: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, Document>,
    stages: HashMap<(String, String), StageExecution>,
    errors: Vec<PipelineErrorRecord>,
    locks: HashMap<String, Lease>,
}

/// In-memory implementation of [`DurableStore`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of error records.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// Returns the number of live leases.
    #[must_use]
    pub fn live_lock_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .locks
            .values()
            .filter(|lease| lease.is_live(now))
            .count()
    }
}

fn stage_key(document_id: &str, stage_name: &str) -> (String, String) {
    (document_id.to_string(), stage_name.to_string())
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert_document(&self, document: &Document) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .documents
            .entry(document.id.clone())
            .or_insert_with(|| document.clone());
        for stage in &document.stages {
            inner
                .stages
                .entry(stage_key(&document.id, stage))
                .or_insert_with(|| StageExecution::pending(&document.id, stage));
        }
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> StoreResult<Option<Document>> {
        Ok(self.inner.lock().documents.get(document_id).cloned())
    }

    async fn get_stage(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> StoreResult<Option<StageExecution>> {
        Ok(self
            .inner
            .lock()
            .stages
            .get(&stage_key(document_id, stage_name))
            .cloned())
    }

    async fn list_stages(&self, document_id: &str) -> StoreResult<Vec<StageExecution>> {
        Ok(self
            .inner
            .lock()
            .stages
            .values()
            .filter(|row| row.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn update_stage(
        &self,
        document_id: &str,
        stage_name: &str,
        update: &StageUpdate,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let live_owner = inner
            .locks
            .get(&LockKey::new(document_id, stage_name).fingerprint())
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner);
        if !update.lease.admits(live_owner) {
            return Ok(false);
        }

        match inner.stages.get_mut(&stage_key(document_id, stage_name)) {
            Some(row) if update.matches(row.status) => {
                update.apply_to(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_running_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>> {
        Ok(self
            .inner
            .lock()
            .stages
            .values()
            .filter(|row| {
                row.status == StageStatus::Running
                    && row.started_at.map_or(true, |started| started < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn append_error(&self, record: &PipelineErrorRecord) -> StoreResult<()> {
        self.inner.lock().errors.push(record.clone());
        Ok(())
    }

    async fn list_errors(&self, document_id: &str) -> StoreResult<Vec<PipelineErrorRecord>> {
        Ok(self
            .inner
            .lock()
            .errors
            .iter()
            .filter(|record| record.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        key: &LockKey,
        owner: Uuid,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let id = key.fingerprint();

        if inner.locks.get(&id).is_some_and(|lease| lease.is_live(now)) {
            return Ok(false);
        }

        inner.locks.insert(
            id,
            Lease {
                owner,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_lock(&self, key: &LockKey, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.locks.get_mut(&key.fingerprint()) {
            Some(lease) if lease.owner == owner && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &LockKey, owner: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let id = key.fingerprint();
        if inner.locks.get(&id).is_some_and(|lease| lease.owner == owner) {
            inner.locks.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn force_release_lock(&self, key: &LockKey) -> StoreResult<bool> {
        Ok(self.inner.lock().locks.remove(&key.fingerprint()).is_some())
    }

    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .locks
            .get(&key.fingerprint())
            .is_some_and(|lease| lease.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn doc() -> Document {
        Document::new("doc-1", vec!["a".to_string(), "b".to_string()])
    }

    #[tokio::test]
    async fn test_insert_document_creates_pending_rows() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();

        let rows = store.list_stages("doc-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == StageStatus::Pending));
        assert!(store.get_document("doc-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_document_is_idempotent() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();
        store
            .update_stage("doc-1", "a", &StageUpdate::start(Utc::now()))
            .await
            .unwrap();

        store.insert_document(&doc()).await.unwrap();

        let row = store.get_stage("doc-1", "a").await.unwrap().unwrap();
        assert_eq!(row.status, StageStatus::Running);
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_update_stage_is_conditional() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();

        let applied = store
            .update_stage("doc-1", "a", &StageUpdate::complete(Utc::now()))
            .await
            .unwrap();
        assert!(!applied);

        assert!(store
            .update_stage("doc-1", "a", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
        assert!(!store
            .update_stage("doc-1", "a", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
        assert!(!store
            .update_stage("doc-1", "missing", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_update_stage_checks_lease() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();
        let owner = Uuid::new_v4();
        store
            .try_acquire_lock(&LockKey::new("doc-1", "a"), owner, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!store
            .update_stage("doc-1", "a", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
        assert!(!store
            .update_stage("doc-1", "a", &StageUpdate::resume(Utc::now(), Uuid::new_v4()))
            .await
            .unwrap());
        assert!(store
            .update_stage("doc-1", "a", &StageUpdate::resume(Utc::now(), owner))
            .await
            .unwrap());

        // Other stages of the document are not covered by the lease.
        assert!(store
            .update_stage("doc-1", "b", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_does_not_gate_updates() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();
        store
            .try_acquire_lock(&LockKey::new("doc-1", "a"), Uuid::new_v4(), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!store
            .update_stage("doc-1", "a", &StageUpdate::cancel_scheduled("cancelled"))
            .await
            .unwrap());
        assert!(store
            .update_stage("doc-1", "a", &StageUpdate::start(Utc::now()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        let key = LockKey::new("doc-1", "a");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_lock(&key, first, ttl).await.unwrap());
        assert!(!store.try_acquire_lock(&key, second, ttl).await.unwrap());
        assert!(store.is_locked(&key).await.unwrap());

        // Only the owner can release.
        assert!(!store.release_lock(&key, second).await.unwrap());
        assert!(store.release_lock(&key, first).await.unwrap());
        assert!(store.try_acquire_lock(&key, second, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryStore::new();
        let key = LockKey::new("doc-1", "a");
        let first = Uuid::new_v4();

        assert!(store
            .try_acquire_lock(&key, first, Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(!store.is_locked(&key).await.unwrap());
        assert!(!store.renew_lock(&key, first, Duration::from_secs(1)).await.unwrap());
        assert!(store
            .try_acquire_lock(&key, Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let store = InMemoryStore::new();
        let key = LockKey::new("doc-1", "a");
        store
            .try_acquire_lock(&key, Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(store.force_release_lock(&key).await.unwrap());
        assert_eq!(store.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_listed_per_document_in_order() {
        let store = InMemoryStore::new();
        for retry in 0..3 {
            store
                .append_error(&PipelineErrorRecord::new(
                    "doc-1",
                    "a",
                    retry,
                    ErrorKind::Transient,
                    "retry_scheduled",
                ))
                .await
                .unwrap();
        }
        store
            .append_error(&PipelineErrorRecord::new(
                "doc-2",
                "a",
                0,
                ErrorKind::Permanent,
                "permanent_failure",
            ))
            .await
            .unwrap();

        let errors = store.list_errors("doc-1").await.unwrap();
        let retries: Vec<u32> = errors.iter().map(|e| e.retry_count).collect();
        assert_eq!(retries, vec![0, 1, 2]);
        assert_eq!(store.error_count(), 4);
    }

    #[tokio::test]
    async fn test_list_running_before_cutoff() {
        let store = InMemoryStore::new();
        store.insert_document(&doc()).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        store
            .update_stage("doc-1", "a", &StageUpdate::start(long_ago))
            .await
            .unwrap();

        let stale = store
            .list_running_before(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].stage_name, "a");

        let none = store
            .list_running_before(Utc::now() - chrono::Duration::minutes(20))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
