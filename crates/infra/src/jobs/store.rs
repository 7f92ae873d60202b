//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use karaoke_core::{DomainError, Job, JobId, JobStatus, StatusChange};

/// Keyed table holding one record per job.
///
/// All mutation goes through [`JobStore::transition`], a single-item conditional
/// update: the write only lands if the stored status is an allowed predecessor
/// of the requested one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Point read.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Conditionally move a job to a new status and return the updated record.
    async fn transition(&self, job_id: JobId, change: &StatusChange) -> Result<Job, JobStoreError>;

    /// Full scan of the table.
    async fn scan(&self) -> Result<ScanOutput, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is {current}, cannot move to {requested}")]
    ConditionFailed {
        job_id: JobId,
        current: JobStatus,
        requested: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

/// Result of a full scan.
///
/// `truncated` is the store's own signal that `items` is not the whole table
/// (e.g. a row cap was hit); callers must surface it rather than drop it.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanOutput {
    pub items: Vec<Job>,
    pub count: usize,
    pub scanned_count: usize,
    pub truncated: bool,
}

impl ScanOutput {
    pub fn complete(items: Vec<Job>) -> Self {
        let count = items.len();
        Self {
            items,
            count,
            scanned_count: count,
            truncated: false,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    async fn transition(&self, job_id: JobId, change: &StatusChange) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        job.apply(change, Utc::now()).map_err(|e| match e {
            DomainError::InvalidTransition { from, to } => JobStoreError::ConditionFailed {
                job_id,
                current: from,
                requested: to,
            },
            other => JobStoreError::storage(other.to_string()),
        })?;

        Ok(job.clone())
    }

    async fn scan(&self) -> Result<ScanOutput, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<_> = jobs.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(ScanOutput::complete(items))
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn transition(&self, job_id: JobId, change: &StatusChange) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, change).await
    }

    async fn scan(&self) -> Result<ScanOutput, JobStoreError> {
        (**self).scan().await
    }
}
