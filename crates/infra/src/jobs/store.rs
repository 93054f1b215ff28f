//! Durable store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use verdant_core::{JobError, JobId};

use super::record::{self, RecordError};
use super::types::{Job, JobFilter};

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// The id must not exist yet.
    Create,
    /// The stored record must be at exactly this version.
    Version(u64),
    /// Unconditional overwrite.
    Any,
}

/// Versioned, transactional job store keyed by job id.
///
/// Each call is one storage transaction: a record is either fully written
/// or not written at all. Conditional writes are the only mutual-exclusion
/// primitive the queue uses, so implementations must evaluate the condition
/// and apply the write atomically, even across processes sharing the
/// underlying storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write `job` if `condition` holds; returns the new stored version.
    async fn put(&self, job: &Job, condition: WriteCondition) -> Result<u64, StoreError>;

    /// Get a job by id. The returned job's `version` is the stored version.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Every readable job matching `filter`, oldest first, plus every
    /// record that could not be decoded. An unreadable record never hides
    /// the others.
    async fn scan(&self, filter: &JobFilter) -> Result<Scan, StoreError>;

    /// All readable jobs matching `filter`, oldest first.
    async fn get_all(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self.scan(filter).await?.jobs)
    }

    /// Remove a job; with `expected`, only if it is still at that version.
    /// Returns whether a record was removed.
    async fn delete(&self, id: JobId, expected: Option<u64>) -> Result<bool, StoreError>;
}

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("write precondition failed for job {0}")]
    Conflict(JobId),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(id: impl ToString, err: RecordError) -> Self {
        Self::Corrupt {
            id: id.to_string(),
            reason: err.to_string(),
        }
    }

    /// The classified form surfaced on the affected job.
    pub fn to_job_error(&self) -> JobError {
        JobError::storage_unavailable(self.to_string())
    }
}

/// A stored record that no longer decodes as a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRecord {
    pub id: String,
    pub reason: String,
}

impl UnreadableRecord {
    pub fn to_job_error(&self) -> JobError {
        JobError::storage_unavailable(format!("corrupt record {}: {}", self.id, self.reason))
    }
}

/// Result of a full read of the store.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub jobs: Vec<Job>,
    pub unreadable: Vec<UnreadableRecord>,
}

impl Scan {
    /// Add one decoded record. `Corrupt` goes to `unreadable`; any other
    /// error aborts the scan.
    pub(crate) fn push(&mut self, decoded: Result<Job, StoreError>, filter: &JobFilter) -> Result<(), StoreError> {
        match decoded {
            Ok(job) => {
                if filter.matches(&job) {
                    self.jobs.push(job);
                }
                Ok(())
            }
            Err(StoreError::Corrupt { id, reason }) => {
                self.unreadable.push(UnreadableRecord { id, reason });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.jobs
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.unreadable.sort_by(|a, b| a.id.cmp(&b.id));
        self
    }
}

/// In-memory store for tests/dev.
///
/// Records are kept as encoded documents, so everything read back has gone
/// through the same codec as the on-disk store. Cloning shares the map,
/// which lets tests "restart" a queue over surviving storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    records: Arc<Mutex<HashMap<JobId, (u64, String)>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent call fail with `Unavailable` (quota/corruption
    /// simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store a raw document, bypassing the codec (for migration tests).
    pub fn insert_raw(&self, id: JobId, version: u64, document: impl Into<String>) -> Result<(), StoreError> {
        self.lock()?.insert(id, (version, document.into()));
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, (u64, String)>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn decode(id: JobId, version: u64, document: &str) -> Result<Job, StoreError> {
        let mut job = record::decode(document).map_err(|e| StoreError::corrupt(id, e))?;
        job.version = version;
        Ok(job)
    }
}

#[async_trait]
impl DurableStore for InMemoryJobStore {
    async fn put(&self, job: &Job, condition: WriteCondition) -> Result<u64, StoreError> {
        let document = record::encode(job).map_err(|e| StoreError::corrupt(job.id, e))?;
        let mut records = self.lock()?;

        let current = records.get(&job.id).map(|(v, _)| *v);
        let allowed = match condition {
            WriteCondition::Create => current.is_none(),
            WriteCondition::Version(expected) => current == Some(expected),
            WriteCondition::Any => true,
        };
        if !allowed {
            return Err(StoreError::Conflict(job.id));
        }

        let version = current.unwrap_or(0) + 1;
        records.insert(job.id, (version, document));
        Ok(version)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let records = self.lock()?;
        records
            .get(&id)
            .map(|(version, doc)| Self::decode(id, *version, doc))
            .transpose()
    }

    async fn scan(&self, filter: &JobFilter) -> Result<Scan, StoreError> {
        let records = self.lock()?;
        let mut scan = Scan::default();
        for (id, (version, doc)) in records.iter() {
            scan.push(Self::decode(*id, *version, doc), filter)?;
        }
        Ok(scan.finish())
    }

    async fn delete(&self, id: JobId, expected: Option<u64>) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        match (records.get(&id), expected) {
            (None, _) => Ok(false),
            (Some((version, _)), Some(expected)) if *version != expected => Err(StoreError::Conflict(id)),
            (Some(_), _) => {
                records.remove(&id);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    async fn put(&self, job: &Job, condition: WriteCondition) -> Result<u64, StoreError> {
        (**self).put(job, condition).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn scan(&self, filter: &JobFilter) -> Result<Scan, StoreError> {
        (**self).scan(filter).await
    }

    async fn delete(&self, id: JobId, expected: Option<u64>) -> Result<bool, StoreError> {
        (**self).delete(id, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobStatus;
    use verdant_core::JobKind;

    fn job() -> Job {
        Job::new(JobKind::SubmitWork, serde_json::json!({"title": "Planted 3 trees"}), 5)
    }

    #[tokio::test]
    async fn create_then_versioned_update() {
        let store = InMemoryJobStore::new();
        let mut job = job();

        assert_eq!(store.put(&job, WriteCondition::Create).await.unwrap(), 1);
        assert_eq!(store.put(&job, WriteCondition::Create).await, Err(StoreError::Conflict(job.id)));

        job.status = JobStatus::Active;
        assert_eq!(store.put(&job, WriteCondition::Version(1)).await.unwrap(), 2);
        assert_eq!(store.put(&job, WriteCondition::Version(1)).await, Err(StoreError::Conflict(job.id)));

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn conditional_delete() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.put(&job, WriteCondition::Create).await.unwrap();

        assert_eq!(store.delete(job.id, Some(7)).await, Err(StoreError::Conflict(job.id)));
        assert!(store.delete(job.id, Some(1)).await.unwrap());
        assert!(!store.delete(job.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn get_all_filters_and_orders_by_creation() {
        let store = InMemoryJobStore::new();
        let first = job();
        let second = Job::new(JobKind::MintCertificate, serde_json::json!({}), 5);
        store.put(&second, WriteCondition::Create).await.unwrap();
        store.put(&first, WriteCondition::Create).await.unwrap();

        let all = store.get_all(&JobFilter::all()).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first.id, second.id]);

        let mints = store
            .get_all(&JobFilter::all().with_kinds([JobKind::MintCertificate]))
            .await
            .unwrap();
        assert_eq!(mints.len(), 1);
        assert_eq!(mints[0].id, second.id);
    }

    #[tokio::test]
    async fn unavailable_storage_is_reported() {
        let store = InMemoryJobStore::new();
        store.set_unavailable(true);

        let err = store.put(&job(), WriteCondition::Create).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(err.to_job_error().category, verdant_core::ErrorCategory::StorageUnavailable);
    }

    #[tokio::test]
    async fn undecodable_record_is_corrupt() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        store.insert_raw(id, 1, "{oops").unwrap();

        assert!(matches!(store.get(id).await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn scan_reports_unreadable_records_beside_healthy_ones() {
        let store = InMemoryJobStore::new();
        let healthy = job();
        store.put(&healthy, WriteCondition::Create).await.unwrap();
        let broken = JobId::new();
        store.insert_raw(broken, 1, "{oops").unwrap();

        let scan = store.scan(&JobFilter::all()).await.unwrap();
        assert_eq!(scan.jobs.len(), 1);
        assert_eq!(scan.jobs[0].id, healthy.id);
        assert_eq!(scan.unreadable.len(), 1);
        assert_eq!(scan.unreadable[0].id, broken.to_string());
        assert_eq!(
            scan.unreadable[0].to_job_error().category,
            verdant_core::ErrorCategory::StorageUnavailable
        );

        assert_eq!(store.get_all(&JobFilter::all()).await.unwrap().len(), 1);
    }
}
