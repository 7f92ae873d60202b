//! Job lifecycle controller: the operations behind the HTTP API.
//!
//! ## Trigger ordering
//!
//! `trigger_processing` writes `uploading -> processing` first and only then
//! enqueues the work message. The conditional write serialises concurrent
//! triggers, so at most one caller enqueues. If the enqueue fails the job is moved
//! on to `failed` with the queue error as reason; only if that write fails too can a
//! job be left in `processing` without a message, which is logged at error level.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use karaoke_core::{BlobLocation, Job, JobId, JobStatus, StatusChange, WorkMessage};

use crate::backends::Backends;
use crate::blob::{BlobError, BlobStore, CredentialError, UploadCredential, UploadSigner};
use crate::queue::{MessageId, QueueError, WorkQueue};

use super::store::{JobStore, JobStoreError, ScanOutput};

/// Key of the uploaded input for a job.
pub fn input_key(job_id: JobId) -> String {
    format!("track_{job_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is in a wrong state ({status})")]
    InvalidState { job_id: JobId, status: JobStatus },
    #[error("invalid blob location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("upload credential does not cover {0}")]
    ScopeMismatch(BlobLocation),
    #[error("input already uploaded: {0}")]
    AlreadyUploaded(BlobLocation),
    #[error(transparent)]
    Store(JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl From<JobStoreError> for ControllerError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => Self::NotFound(id),
            JobStoreError::ConditionFailed { job_id, current, .. } => Self::InvalidState {
                job_id,
                status: current,
            },
            other => Self::Store(other),
        }
    }
}

/// Result of `create_job`.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub upload_credential: UploadCredential,
    #[serde(skip)]
    pub job: Job,
}

/// Result of `trigger_processing`.
#[derive(Debug, Clone, Serialize)]
pub struct TriggeredJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message_id: MessageId,
}

#[derive(Clone)]
pub struct JobController {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    blobs: Arc<dyn BlobStore>,
    signer: UploadSigner,
    input_bucket: String,
    output_bucket: Option<String>,
}

impl core::fmt::Debug for JobController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobController")
            .field("signer", &self.signer)
            .field("input_bucket", &self.input_bucket)
            .field("output_bucket", &self.output_bucket)
            .finish_non_exhaustive()
    }
}

impl JobController {
    pub fn new(backends: &Backends, signer: UploadSigner, input_bucket: impl Into<String>) -> Self {
        Self {
            jobs: backends.jobs.clone(),
            queue: backends.queue.clone(),
            blobs: backends.blobs.clone(),
            signer,
            input_bucket: input_bucket.into(),
            output_bucket: None,
        }
    }

    /// Bucket whose objects the download route may serve.
    pub fn with_output_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.output_bucket = Some(bucket.into());
        self
    }

    pub fn input_location(&self, job_id: JobId) -> Result<BlobLocation, ControllerError> {
        BlobLocation::new(self.input_bucket.as_str(), input_key(job_id))
            .map_err(|e| ControllerError::InvalidLocation(e.to_string()))
    }

    /// Create a job in `uploading` and issue its upload credential.
    #[instrument(skip(self), err)]
    pub async fn create_job(&self) -> Result<CreatedJob, ControllerError> {
        let job_id = JobId::new();
        let location = self.input_location(job_id)?;
        let upload_credential = self.signer.issue(job_id, &location)?;

        let job = Job::new(job_id, location.to_string(), Utc::now());
        self.jobs.create(&job).await?;

        info!(%job_id, input_location = %job.input_location, "job created");
        Ok(CreatedJob {
            job_id,
            upload_credential,
            job,
        })
    }

    pub async fn list_jobs(&self) -> Result<ScanOutput, ControllerError> {
        let out = self.jobs.scan().await?;
        if out.truncated {
            warn!(count = out.count, "job listing truncated by the store");
        }
        Ok(out)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, ControllerError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(ControllerError::NotFound(job_id))
    }

    /// Move an `uploading` job to `processing` and enqueue its work message.
    #[instrument(skip(self), err)]
    pub async fn trigger_processing(&self, job_id: JobId) -> Result<TriggeredJob, ControllerError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Uploading {
            return Err(ControllerError::InvalidState {
                job_id,
                status: job.status,
            });
        }

        // Loses cleanly to a concurrent trigger.
        let job = self.jobs.transition(job_id, &StatusChange::processing()).await?;

        let body = WorkMessage::new(job_id, job.input_location.as_str()).to_body();
        match self.queue.send(&body).await {
            Ok(message_id) => {
                info!(%job_id, %message_id, "processing triggered");
                Ok(TriggeredJob {
                    job_id,
                    status: job.status,
                    message_id,
                })
            }
            Err(queue_error) => {
                self.compensate_failed_enqueue(job_id, &queue_error).await;
                Err(queue_error.into())
            }
        }
    }

    async fn compensate_failed_enqueue(&self, job_id: JobId, queue_error: &QueueError) {
        let change = StatusChange::failed(format!("could not enqueue work message: {queue_error}"));
        match self.jobs.transition(job_id, &change).await {
            Ok(_) => warn!(%job_id, error = %queue_error, "enqueue failed; job marked failed"),
            Err(store_error) => error!(
                %job_id,
                error = %queue_error,
                compensation_error = %store_error,
                "enqueue failed and job could not be marked failed; job left in processing without a message"
            ),
        }
    }

    /// Store an input file presented with an upload credential.
    #[instrument(skip(self, token, bytes), fields(size = bytes.len()), err)]
    pub async fn upload_input(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        bytes: Vec<u8>,
    ) -> Result<BlobLocation, ControllerError> {
        let location =
            BlobLocation::new(bucket, key).map_err(|e| ControllerError::InvalidLocation(e.to_string()))?;

        let claims = self.signer.verify(token)?;
        if !claims.covers(&location) {
            return Err(ControllerError::ScopeMismatch(location));
        }

        let job_id = claims.job_id()?;
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Uploading {
            return Err(ControllerError::InvalidState {
                job_id,
                status: job.status,
            });
        }
        if self.blobs.exists(&location).await? {
            return Err(ControllerError::AlreadyUploaded(location));
        }

        self.blobs.put(&location, bytes).await?;
        info!(%job_id, %location, "input uploaded");
        Ok(location)
    }

    /// Read an object from the output bucket.
    pub async fn read_output(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ControllerError> {
        let location =
            BlobLocation::new(bucket, key).map_err(|e| ControllerError::InvalidLocation(e.to_string()))?;
        if self.output_bucket.as_deref() != Some(bucket) {
            return Err(BlobError::NotFound(location).into());
        }
        Ok(self.blobs.get(&location).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::jobs::InMemoryJobStore;
    use crate::queue::{InMemoryWorkQueue, QueueMessage, ReceiptHandle, ReceiveOptions};

    struct Fixture {
        controller: JobController,
        jobs: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryWorkQueue>,
    }

    fn signer() -> UploadSigner {
        UploadSigner::new("test-secret", Duration::from_secs(120), "http://localhost:8080")
    }

    fn fixture() -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryWorkQueue::new());
        let backends = Backends {
            jobs: jobs.clone(),
            queue: queue.clone(),
            blobs: Arc::new(InMemoryBlobStore::new()),
        };
        Fixture {
            controller: JobController::new(&backends, signer(), "input").with_output_bucket("output"),
            jobs,
            queue,
        }
    }

    struct RejectingQueue;

    #[async_trait]
    impl WorkQueue for RejectingQueue {
        async fn send(&self, _body: &str) -> Result<MessageId, QueueError> {
            Err(QueueError::unavailable("connection refused"))
        }

        async fn receive(&self, _options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
            Ok(Vec::new())
        }

        async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
            Err(QueueError::UnknownReceipt(receipt.clone()))
        }
    }

    #[tokio::test]
    async fn create_job_starts_uploading_at_deterministic_location() {
        let f = fixture();
        let created = f.controller.create_job().await.unwrap();
        let id = created.job_id;

        let job = f.controller.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Uploading);
        assert_eq!(job.input_location, format!("s3://input/track_{id}"));
        assert!(job.input_location.ends_with(&id.to_string()));
        assert_eq!(created.upload_credential.key, format!("track_{id}"));
    }

    #[tokio::test]
    async fn trigger_enqueues_exactly_one_message() {
        let f = fixture();
        let id = f.controller.create_job().await.unwrap().job_id;

        let triggered = f.controller.trigger_processing(id).await.unwrap();
        assert_eq!(triggered.status, JobStatus::Processing);
        assert_eq!(f.controller.get_job(id).await.unwrap().status, JobStatus::Processing);

        let bodies = f.queue.bodies();
        assert_eq!(bodies.len(), 1);
        let msg = WorkMessage::from_body(&bodies[0]).unwrap();
        assert_eq!(msg.job_id, id);
        assert_eq!(msg.input_location, format!("s3://input/track_{id}"));
    }

    #[tokio::test]
    async fn trigger_outside_uploading_changes_nothing() {
        let f = fixture();
        let id = f.controller.create_job().await.unwrap().job_id;
        f.controller.trigger_processing(id).await.unwrap();
        let before = f.controller.get_job(id).await.unwrap();

        let err = f.controller.trigger_processing(id).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidState { status: JobStatus::Processing, .. }
        ));
        assert_eq!(f.controller.get_job(id).await.unwrap(), before);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn trigger_unknown_job() {
        let f = fixture();
        assert!(matches!(
            f.controller.trigger_processing(JobId::new()).await,
            Err(ControllerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_enqueue_marks_job_failed() {
        let f = fixture();
        let backends = Backends {
            jobs: f.jobs.clone(),
            queue: Arc::new(RejectingQueue),
            blobs: Arc::new(InMemoryBlobStore::new()),
        };
        let controller = JobController::new(&backends, signer(), "input");
        let id = controller.create_job().await.unwrap().job_id;

        let err = controller.trigger_processing(id).await.unwrap_err();
        assert!(matches!(err, ControllerError::Queue(QueueError::Unavailable(_))));

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("enqueue"));
    }

    #[tokio::test]
    async fn upload_requires_matching_credential() {
        let f = fixture();
        let a = f.controller.create_job().await.unwrap();
        let b = f.controller.create_job().await.unwrap();
        let token_a = a.upload_credential.token().unwrap().to_string();
        let key_a = a.upload_credential.key.clone();

        let err = f
            .controller
            .upload_input("input", &b.upload_credential.key, &token_a, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ScopeMismatch(_)));

        let err = f
            .controller
            .upload_input("input", &key_a, "not-a-token", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Credential(CredentialError::Invalid(_))));

        f.controller
            .upload_input("input", &key_a, &token_a, b"audio".to_vec())
            .await
            .unwrap();

        let err = f
            .controller
            .upload_input("input", &key_a, &token_a, b"again".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AlreadyUploaded(_)));
    }

    #[tokio::test]
    async fn list_after_n_creates() {
        let f = fixture();
        for _ in 0..4 {
            f.controller.create_job().await.unwrap();
        }

        let out = f.controller.list_jobs().await.unwrap();
        assert_eq!(out.items.len(), 4);
        assert_eq!(out.count, 4);
        assert_eq!(out.scanned_count, 4);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn downloads_are_limited_to_the_output_bucket() {
        let f = fixture();
        assert!(matches!(
            f.controller.read_output("input", "track_x").await,
            Err(ControllerError::Blob(BlobError::NotFound(_)))
        ));
        assert!(matches!(
            f.controller.read_output("output", "track_x.mp3").await,
            Err(ControllerError::Blob(BlobError::NotFound(_)))
        ));
    }
}
