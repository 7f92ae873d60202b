//! Infrastructure layer: job store, work queue, blob store, separation and the worker.

pub mod backends;
pub mod blob;
pub mod config;
pub mod jobs;
pub mod queue;
pub mod separation;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_support;

pub use backends::{BackendError, Backends};
pub use config::{BackendConfig, ConfigError, ControllerConfig, OutputNaming, WorkerConfig};
