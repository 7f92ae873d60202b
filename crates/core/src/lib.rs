//! `karaoke-core`: job lifecycle domain for the vocal-removal service.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the job
//! record and its status state machine, the work message envelope, and blob
//! locators.

pub mod error;
pub mod id;
pub mod job;
pub mod location;
pub mod message;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus, StatusChange};
pub use location::{BlobLocation, render_template};
pub use message::WorkMessage;
