//! Service wiring shared by every route.

use std::time::Duration;

use karaoke_infra::blob::UploadSigner;
use karaoke_infra::config::DEV_SIGNING_SECRET;
use karaoke_infra::jobs::JobController;
use karaoke_infra::{Backends, ControllerConfig};

/// Default request body cap for uploads.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppServices {
    pub controller: JobController,
    pub max_upload_bytes: usize,
}

impl AppServices {
    pub fn new(controller: JobController) -> Self {
        Self {
            controller,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max: usize) -> Self {
        self.max_upload_bytes = max;
        self
    }
}

pub fn build_services(config: &ControllerConfig, backends: &Backends) -> AppServices {
    if config.insecure_secret {
        tracing::warn!("UPLOAD_SIGNING_SECRET not set; using insecure dev default");
    }

    let signer = UploadSigner::new(
        config.signing_secret.as_bytes(),
        config.upload_ttl,
        config.upload_base_url.as_str(),
    );
    let mut controller = JobController::new(backends, signer, config.upload_bucket.as_str());
    if let Some(bucket) = &config.output_bucket {
        controller = controller.with_output_bucket(bucket.as_str());
    }

    AppServices::new(controller).with_max_upload_bytes(config.max_upload_bytes)
}

/// In-memory services for local runs and tests. Uploads are addressed at `base_url`.
pub fn in_memory_services(base_url: &str) -> (AppServices, Backends) {
    let backends = Backends::in_memory();
    let signer = UploadSigner::new(DEV_SIGNING_SECRET, Duration::from_secs(120), base_url);
    let controller = JobController::new(&backends, signer, "input").with_output_bucket("output");
    (AppServices::new(controller), backends)
}
