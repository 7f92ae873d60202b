//! Job records and the lifecycle controller.
//!
//! ## Components
//!
//! - `JobStore`: one record per job, conditional status updates, full scan
//! - `InMemoryJobStore` / `PostgresJobStore`: the two store backends
//! - `JobController`: create, list, get and trigger operations plus the upload path

pub mod controller;
pub mod postgres;
pub mod store;

pub use controller::{ControllerError, CreatedJob, JobController, TriggeredJob, input_key};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, ScanOutput};
