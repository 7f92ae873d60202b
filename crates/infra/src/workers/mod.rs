//! Background workers.

pub mod separation_worker;

pub use separation_worker::{
    CycleReport, MessageOutcome, ProcessingError, SeparationWorker, WorkerHandle, WorkerSettings, WorkerStats,
};
