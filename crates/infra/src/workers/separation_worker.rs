//! Queue-driven separation worker.
//!
//! ## Cycle
//!
//! 1. Receive a batch (hidden for the visibility timeout, not removed).
//! 2. Process every message in its own task, at most `max_concurrent_jobs` at once.
//! 3. Each task writes the job outcome (`successful` or `failed`) and then deletes
//!    the message, whatever happened.
//! 4. Fold the per-message outcomes into a [`CycleReport`], log it, wait the polling
//!    interval (or stop on shutdown).
//!
//! A panic while handling a message is caught inside its task and recorded as a
//! failure, so the job still ends `failed` and the message is still deleted.
//!
//! A batch is never interrupted: shutdown is only observed while receiving or
//! sleeping, so in-flight messages always reach their status write and ack.
//!
//! Duplicate deliveries are expected. A message whose job is already terminal is
//! acknowledged without running separation again.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use karaoke_core::{BlobLocation, JobId, JobStatus, StatusChange, WorkMessage};

use crate::backends::Backends;
use crate::blob::{BlobError, BlobStore};
use crate::config::{OutputNaming, WorkerConfig};
use crate::jobs::{JobStore, JobStoreError};
use crate::queue::{QueueError, QueueMessage, ReceiveOptions, WorkQueue};
use crate::separation::{ACCOMPANIMENT, SeparationError, SeparationParams, Separator};

/// Why a message could not be turned into an output.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("malformed work message: {0}")]
    MalformedMessage(String),
    #[error("job {0} does not exist")]
    JobNotFound(JobId),
    #[error("job {0} has not been triggered yet")]
    NotTriggered(JobId),
    #[error("invalid blob location: {0}")]
    InvalidLocation(String),
    #[error("could not download input: {0}")]
    Download(#[source] BlobError),
    #[error("could not prepare scratch space: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("separation failed: {0}")]
    Separation(#[from] SeparationError),
    #[error("could not upload output: {0}")]
    Upload(#[source] BlobError),
    #[error("could not record job outcome: {0}")]
    Store(#[from] JobStoreError),
    #[error("processing panicked: {0}")]
    Panicked(String),
}

/// Result of handling one message. The message is acknowledged in every case.
#[derive(Debug)]
pub enum MessageOutcome {
    Succeeded {
        job_id: JobId,
        output_location: String,
    },
    Failed {
        job_id: Option<JobId>,
        error: ProcessingError,
        /// Whether `failed` was written to the job record.
        status_recorded: bool,
    },
    /// Job already terminal; nothing was re-run.
    Skipped { job_id: JobId, status: JobStatus },
}

impl MessageOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Succeeded { job_id, .. } | Self::Skipped { job_id, .. } => Some(*job_id),
            Self::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failures caused by a panic during handling (also counted in `failed`).
    pub panicked: usize,
    pub acked: usize,
    pub receive_failed: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: &MessageOutcome, acked: bool) {
        match outcome {
            MessageOutcome::Succeeded { .. } => self.succeeded += 1,
            MessageOutcome::Failed { error, .. } => {
                self.failed += 1;
                if matches!(error, ProcessingError::Panicked(_)) {
                    self.panicked += 1;
                }
            }
            MessageOutcome::Skipped { .. } => self.skipped += 1,
        }
        if acked {
            self.acked += 1;
        }
    }

    fn log(&self, worker: &str) {
        if self.receive_failed {
            return;
        }
        if self.received == 0 {
            debug!(worker, "no messages");
            return;
        }
        info!(
            worker,
            received = self.received,
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            panicked = self.panicked,
            acked = self.acked,
            "cycle finished"
        );
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub panicked: u64,
    pub receive_errors: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.received += report.received as u64;
        self.succeeded += report.succeeded as u64;
        self.failed += report.failed as u64;
        self.skipped += report.skipped as u64;
        self.panicked += report.panicked as u64;
        if report.receive_failed {
            self.receive_errors += 1;
        }
        self.last_cycle_at = Some(Utc::now());
    }
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub polling_interval: Duration,
    pub receive: ReceiveOptions,
    pub max_concurrent_jobs: usize,
    pub separation: SeparationParams,
    pub output: OutputNaming,
}

impl WorkerSettings {
    pub fn new(output: OutputNaming) -> Self {
        Self {
            name: "separation-worker".to_string(),
            polling_interval: Duration::from_secs(10),
            receive: ReceiveOptions::default(),
            max_concurrent_jobs: 1,
            separation: SeparationParams::default(),
            output,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            name: "separation-worker".to_string(),
            polling_interval: config.polling_interval,
            receive: config.receive.clone(),
            max_concurrent_jobs: config.max_concurrent_jobs,
            separation: config.separation.clone(),
            output: config.output.clone(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }
}

/// Handle to a spawned worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request shutdown, wait for the current cycle to drain and return the final stats.
    pub async fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Polls the work queue and runs separation jobs.
pub struct SeparationWorker {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    blobs: Arc<dyn BlobStore>,
    separator: Arc<dyn Separator>,
    settings: WorkerSettings,
}

impl core::fmt::Debug for SeparationWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SeparationWorker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SeparationWorker {
    pub fn new(backends: &Backends, separator: Arc<dyn Separator>, settings: WorkerSettings) -> Self {
        Self {
            jobs: backends.jobs.clone(),
            queue: backends.queue.clone(),
            blobs: backends.blobs.clone(),
            separator,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Start the poll loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(self.run(shutdown_rx, stats.clone()));

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<WorkerStats>>) {
        let name = self.settings.name.clone();
        info!(
            worker = %name,
            interval_secs = self.settings.polling_interval.as_secs_f64(),
            max_concurrent = self.settings.max_concurrent_jobs,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the receive is cancellable; a received batch always drains.
            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = self.queue.receive(&self.settings.receive) => received,
            };
            let report = self.finish_cycle(received).await;
            stats.lock().unwrap_or_else(PoisonError::into_inner).add(&report);

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.settings.polling_interval) => {}
            }
        }

        info!(worker = %name, "worker stopped");
    }

    /// One receive-process-ack cycle.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let received = self.queue.receive(&self.settings.receive).await;
        self.finish_cycle(received).await
    }

    async fn finish_cycle(
        self: &Arc<Self>,
        received: Result<Vec<QueueMessage>, QueueError>,
    ) -> CycleReport {
        let report = match received {
            Ok(batch) => self.process_batch(batch).await,
            Err(e) => {
                warn!(worker = %self.settings.name, error = %e, "receive failed; retrying next cycle");
                CycleReport {
                    receive_failed: true,
                    ..CycleReport::default()
                }
            }
        };
        report.log(&self.settings.name);
        report
    }

    async fn process_batch(self: &Arc<Self>, batch: Vec<QueueMessage>) -> CycleReport {
        let mut report = CycleReport {
            received: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_jobs.max(1)));
        let mut tasks = JoinSet::new();

        for message in batch {
            let worker = Arc::clone(self);
            let permits = permits.clone();
            let span = info_span!(
                "message",
                worker = %self.settings.name,
                message_id = %message.message_id,
                receive_count = message.receive_count,
            );
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    worker.handle_and_ack(message).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, acked)) => report.record(&outcome, acked),
                Err(e) => {
                    error!(worker = %self.settings.name, error = %e, "message task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn handle_and_ack(&self, message: QueueMessage) -> (MessageOutcome, bool) {
        let outcome = match AssertUnwindSafe(self.handle_message(&message))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(&*panic);
                drop(panic);
                self.record_panic(&message, reason).await
            }
        };

        let acked = match self.queue.delete(&message.receipt).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "could not delete message; it will be redelivered");
                false
            }
        };
        (outcome, acked)
    }

    /// Process one message and write the job outcome. Does not acknowledge.
    pub async fn handle_message(&self, message: &QueueMessage) -> MessageOutcome {
        let work = match WorkMessage::from_body(&message.body) {
            Ok(work) => work,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                return MessageOutcome::Failed {
                    job_id: None,
                    error: ProcessingError::MalformedMessage(e.to_string()),
                    status_recorded: false,
                };
            }
        };
        let job_id = work.job_id;

        match self.jobs.get(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                info!(%job_id, status = %job.status, "job already finished; skipping duplicate delivery");
                return MessageOutcome::Skipped {
                    job_id,
                    status: job.status,
                };
            }
            Ok(Some(job)) if job.status == JobStatus::Uploading => {
                warn!(%job_id, "message for a job that was never triggered");
                return MessageOutcome::Failed {
                    job_id: Some(job_id),
                    error: ProcessingError::NotTriggered(job_id),
                    status_recorded: false,
                };
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(%job_id, "message for unknown job");
                return MessageOutcome::Failed {
                    job_id: Some(job_id),
                    error: ProcessingError::JobNotFound(job_id),
                    status_recorded: false,
                };
            }
            Err(e) => warn!(%job_id, error = %e, "could not read job before processing; continuing"),
        }

        info!(%job_id, input = %work.input_location, "processing job");
        match self.separate(&work).await {
            Ok(output_location) => self.record_success(job_id, output_location).await,
            Err(error) => self.record_failure(job_id, error).await,
        }
    }

    async fn record_success(&self, job_id: JobId, output_location: String) -> MessageOutcome {
        let change = StatusChange::successful(output_location.as_str());
        match self.jobs.transition(job_id, &change).await {
            Ok(_) => {
                info!(%job_id, %output_location, "job successful");
                MessageOutcome::Succeeded {
                    job_id,
                    output_location,
                }
            }
            Err(JobStoreError::ConditionFailed { current, .. }) if current.is_terminal() => {
                info!(%job_id, status = %current, "job finished concurrently by another delivery");
                MessageOutcome::Skipped {
                    job_id,
                    status: current,
                }
            }
            Err(e) => {
                error!(%job_id, error = %e, "output uploaded but success could not be recorded");
                self.record_failure(job_id, e.into()).await
            }
        }
    }

    async fn record_failure(&self, job_id: JobId, error: ProcessingError) -> MessageOutcome {
        warn!(%job_id, error = %error, "job failed");

        let status_recorded = match self
            .jobs
            .transition(job_id, &StatusChange::failed(error.to_string()))
            .await
        {
            Ok(_) => true,
            Err(JobStoreError::ConditionFailed { current, .. }) if current.is_terminal() => {
                return MessageOutcome::Skipped {
                    job_id,
                    status: current,
                };
            }
            Err(e) => {
                error!(%job_id, error = %e, "could not mark job failed");
                false
            }
        };

        MessageOutcome::Failed {
            job_id: Some(job_id),
            error,
            status_recorded,
        }
    }

    async fn record_panic(&self, message: &QueueMessage, reason: String) -> MessageOutcome {
        error!(reason = %reason, "message handling panicked");
        match WorkMessage::from_body(&message.body) {
            Ok(work) => {
                self.record_failure(work.job_id, ProcessingError::Panicked(reason))
                    .await
            }
            Err(_) => MessageOutcome::Failed {
                job_id: None,
                error: ProcessingError::Panicked(reason),
                status_recorded: false,
            },
        }
    }

    /// Download, separate, upload. Returns the public output URL.
    async fn separate(&self, work: &WorkMessage) -> Result<String, ProcessingError> {
        let input = work
            .input()
            .map_err(|e| ProcessingError::InvalidLocation(e.to_string()))?;
        let output = self
            .settings
            .output
            .location(work.job_id, &self.settings.separation.codec)
            .map_err(|e| ProcessingError::InvalidLocation(e.to_string()))?;

        // Removed on drop, whatever the outcome.
        let scratch = tempfile::Builder::new()
            .prefix("karaoke-")
            .tempdir()
            .map_err(ProcessingError::Scratch)?;

        let input_path = scratch.path().join(input.file_name());
        self.blobs
            .download_to(&input, &input_path)
            .await
            .map_err(ProcessingError::Download)?;

        let stems = self
            .separator
            .separate(&input_path, &scratch.path().join("stems"), &self.settings.separation)
            .await?;
        let accompaniment = stems
            .get(ACCOMPANIMENT)
            .ok_or_else(|| SeparationError::MissingStem(ACCOMPANIMENT.to_string()))?;

        self.upload_output(accompaniment, &output).await?;
        Ok(self.settings.output.public_url(&output))
    }

    async fn upload_output(&self, path: &Path, output: &BlobLocation) -> Result<(), ProcessingError> {
        self.blobs
            .upload_from(path, output)
            .await
            .map_err(ProcessingError::Upload)?;
        debug!(%output, "output uploaded");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::jobs::InMemoryJobStore;
    use crate::queue::{InMemoryWorkQueue, MessageId, ReceiptHandle};
    use crate::separation::SeparatedStems;
    use crate::test_support::{FakeSeparator, PanickingSeparator};
    use karaoke_core::Job;

    struct Fixture {
        worker: Arc<SeparationWorker>,
        jobs: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryWorkQueue>,
        blobs: Arc<InMemoryBlobStore>,
    }

    fn fixture_with(separator: Arc<dyn Separator>) -> Fixture {
        let settings = WorkerSettings::new(OutputNaming::new("output")).with_max_concurrent(2);
        build_fixture(separator, settings, |queue| queue as Arc<dyn WorkQueue>)
    }

    /// `wrap` decides what the worker sees in front of the shared in-memory queue.
    fn build_fixture(
        separator: Arc<dyn Separator>,
        settings: WorkerSettings,
        wrap: impl FnOnce(Arc<InMemoryWorkQueue>) -> Arc<dyn WorkQueue>,
    ) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryWorkQueue::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let backends = Backends {
            jobs: jobs.clone(),
            queue: wrap(queue.clone()),
            blobs: blobs.clone(),
        };
        Fixture {
            worker: Arc::new(SeparationWorker::new(&backends, separator, settings)),
            jobs,
            queue,
            blobs,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(FakeSeparator))
    }

    /// A `processing` job with its input uploaded and its message enqueued.
    async fn enqueue_job(f: &Fixture, input: &[u8]) -> JobId {
        let id = JobId::new();
        let location = BlobLocation::new("input", format!("track_{id}")).unwrap();
        f.jobs
            .create(&Job::new(id, location.to_string(), Utc::now()))
            .await
            .unwrap();
        f.jobs.transition(id, &StatusChange::processing()).await.unwrap();
        f.blobs.put(&location, input.to_vec()).await.unwrap();
        f.queue
            .send(&WorkMessage::new(id, location.to_string()).to_body())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn successful_cycle_writes_output_and_acks() {
        let f = fixture();
        let id = enqueue_job(&f, b"song").await;

        let report = f.worker.run_cycle().await;
        assert_eq!(report.received, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.acked, 1);
        assert!(f.queue.is_empty());

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Successful);
        assert_eq!(
            job.output_location.as_deref(),
            Some(format!("https://output.s3-eu-west-1.amazonaws.com/track_{id}.mp3").as_str())
        );

        let output = BlobLocation::new("output", format!("track_{id}.mp3")).unwrap();
        assert_eq!(f.blobs.get(&output).await.unwrap(), FakeSeparator::accompaniment_of(b"song"));
    }

    #[tokio::test]
    async fn separation_failure_marks_failed_and_acks() {
        let f = fixture();
        let id = enqueue_job(&f, FakeSeparator::CORRUPT).await;

        let report = f.worker.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.acked, 1);
        assert!(f.queue.is_empty());

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("separation failed"));
    }

    #[tokio::test]
    async fn missing_input_marks_failed() {
        let f = fixture();
        let id = JobId::new();
        let location = format!("s3://input/track_{id}");
        f.jobs.create(&Job::new(id, location.as_str(), Utc::now())).await.unwrap();
        f.jobs.transition(id, &StatusChange::processing()).await.unwrap();
        f.queue.send(&WorkMessage::new(id, location).to_body()).await.unwrap();

        let report = f.worker.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(f.jobs.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn malformed_message_is_acked() {
        let f = fixture();
        f.queue.send("{not json").await.unwrap();

        let report = f.worker.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.acked, 1);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_of_finished_job_is_skipped() {
        let f = fixture();
        let id = enqueue_job(&f, b"song").await;
        f.worker.run_cycle().await;
        let finished = f.jobs.get(id).await.unwrap().unwrap();

        let location = format!("s3://input/track_{id}");
        f.queue.send(&WorkMessage::new(id, location).to_body()).await.unwrap();
        let report = f.worker.run_cycle().await;

        assert_eq!(report.skipped, 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.jobs.get(id).await.unwrap().unwrap(), finished);
    }

    #[tokio::test]
    async fn empty_cycle_is_not_an_error() {
        let f = fixture();
        let report = f.worker.run_cycle().await;
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn panicking_separator_marks_failed_and_acks() {
        // Zero visibility: anything left unacknowledged would come straight back.
        let mut settings = WorkerSettings::new(OutputNaming::new("output"));
        settings.receive.visibility_timeout = Duration::ZERO;
        let f = build_fixture(Arc::new(PanickingSeparator), settings, |queue| {
            queue as Arc<dyn WorkQueue>
        });
        let id = enqueue_job(&f, b"song").await;

        let report = f.worker.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.panicked, 1);
        assert_eq!(report.acked, 1);
        assert!(f.queue.is_empty());

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("separator crashed"));

        for _ in 0..5 {
            assert_eq!(f.worker.run_cycle().await, CycleReport::default());
        }
    }

    /// Tracks how many separations run at the same time.
    #[derive(Debug, Default)]
    struct GaugedSeparator {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Separator for GaugedSeparator {
        async fn separate(
            &self,
            input: &Path,
            output_dir: &Path,
            params: &SeparationParams,
        ) -> Result<SeparatedStems, SeparationError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = FakeSeparator.separate(input, output_dir, params).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn batch_concurrency_is_bounded() {
        let separator = Arc::new(GaugedSeparator::default());
        let settings = WorkerSettings::new(OutputNaming::new("output")).with_max_concurrent(2);
        let f = build_fixture(separator.clone(), settings, |queue| queue as Arc<dyn WorkQueue>);
        for _ in 0..6 {
            enqueue_job(&f, b"song").await;
        }

        let report = f.worker.run_cycle().await;
        assert_eq!(report.received, 6);
        assert_eq!(report.succeeded, 6);

        let peak = separator.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak}");
        assert!(peak >= 1);
    }

    /// Wraps the in-memory queue with injectable receive and delete failures.
    struct FlakyQueue {
        inner: Arc<InMemoryWorkQueue>,
        receive_failures: AtomicUsize,
        fail_deletes: AtomicBool,
    }

    impl FlakyQueue {
        fn new(inner: Arc<InMemoryWorkQueue>, receive_failures: usize, fail_deletes: bool) -> Self {
            Self {
                inner,
                receive_failures: AtomicUsize::new(receive_failures),
                fail_deletes: AtomicBool::new(fail_deletes),
            }
        }
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
            self.inner.send(body).await
        }

        async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
            let remaining = self.receive_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.receive_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::unavailable("connection reset"));
            }
            self.inner.receive(options).await
        }

        async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(QueueError::unavailable("connection reset"));
            }
            self.inner.delete(receipt).await
        }
    }

    #[tokio::test]
    async fn receive_errors_do_not_stop_the_loop() {
        let settings = WorkerSettings::new(OutputNaming::new("output"))
            .with_polling_interval(Duration::from_millis(10));
        let f = build_fixture(Arc::new(FakeSeparator), settings, |queue| {
            Arc::new(FlakyQueue::new(queue, 1, false)) as Arc<dyn WorkQueue>
        });
        let id = enqueue_job(&f, b"song").await;

        let handle = Arc::clone(&f.worker).spawn();
        for _ in 0..200 {
            if handle.stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.shutdown().await;
        assert!(stats.receive_errors >= 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(f.jobs.get(id).await.unwrap().unwrap().status, JobStatus::Successful);
    }

    #[tokio::test]
    async fn failed_delete_is_reported_and_message_stays() {
        let settings = WorkerSettings::new(OutputNaming::new("output"));
        let f = build_fixture(Arc::new(FakeSeparator), settings, |queue| {
            Arc::new(FlakyQueue::new(queue, 0, true)) as Arc<dyn WorkQueue>
        });
        let id = enqueue_job(&f, b"song").await;

        let report = f.worker.run_cycle().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.acked, 0);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.jobs.get(id).await.unwrap().unwrap().status, JobStatus::Successful);
    }

    #[tokio::test]
    async fn spawned_loop_processes_and_shuts_down() {
        let f = fixture();
        let id = enqueue_job(&f, b"song").await;

        let handle = Arc::clone(&f.worker).spawn();
        for _ in 0..200 {
            if handle.stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handle.stats().succeeded, 1);
        assert!(!handle.is_finished());
        handle.shutdown().await;
        assert_eq!(f.jobs.get(id).await.unwrap().unwrap().status, JobStatus::Successful);
    }
}
