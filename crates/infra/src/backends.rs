//! Backend wiring: turns a [`BackendConfig`] into trait objects.

use std::sync::Arc;

use tracing::{info, warn};

use crate::blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
use crate::config::{BackendConfig, BackendTarget};
use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
use crate::queue::{InMemoryWorkQueue, QueueError, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("unsupported backend {key}={value}")]
    Unsupported { key: &'static str, value: String },
}

/// The three shared stores, as used by both the controller and the worker.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub blobs: Arc<dyn BlobStore>,
}

impl core::fmt::Debug for Backends {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Fresh in-process backends (tests/dev).
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryWorkQueue::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
        }
    }

    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let jobs: Arc<dyn JobStore> = match &config.job_store {
            BackendTarget::Memory => {
                warn!("JOB_STORE_URL not set; job records are kept in memory");
                Arc::new(InMemoryJobStore::new())
            }
            BackendTarget::Url(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                info!(table = %config.table_name, "connecting to postgres job store");
                Arc::new(PostgresJobStore::connect(url, config.table_name.as_str()).await?)
            }
            BackendTarget::Url(url) => {
                return Err(BackendError::Unsupported {
                    key: "JOB_STORE_URL",
                    value: url.clone(),
                });
            }
        };

        let queue: Arc<dyn WorkQueue> = match &config.queue {
            BackendTarget::Memory => {
                warn!("QUEUE_URL not set; work queue is in memory");
                Arc::new(InMemoryWorkQueue::new())
            }
            BackendTarget::Url(url) => connect_queue(url, &config.queue_name).await?,
        };

        let blobs: Arc<dyn BlobStore> = match &config.blob_root {
            None => {
                warn!("BLOB_STORE_ROOT not set; blobs are kept in memory");
                Arc::new(InMemoryBlobStore::new())
            }
            Some(root) => {
                info!(root = %root.display(), "using filesystem blob store");
                Arc::new(FsBlobStore::new(root.clone()))
            }
        };

        Ok(Self { jobs, queue, blobs })
    }
}

#[cfg(feature = "redis")]
async fn connect_queue(url: &str, queue_name: &str) -> Result<Arc<dyn WorkQueue>, BackendError> {
    use crate::queue::RedisStreamsWorkQueue;

    if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
        return Err(BackendError::Unsupported {
            key: "QUEUE_URL",
            value: url.to_string(),
        });
    }
    info!(stream = %queue_name, "connecting to redis streams work queue");
    Ok(Arc::new(RedisStreamsWorkQueue::connect(url, queue_name, None).await?))
}

#[cfg(not(feature = "redis"))]
async fn connect_queue(url: &str, _queue_name: &str) -> Result<Arc<dyn WorkQueue>, BackendError> {
    Err(BackendError::Unsupported {
        key: "QUEUE_URL",
        value: format!("{url} (built without the `redis` feature)"),
    })
}
