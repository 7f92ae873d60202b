//! Job record and its status state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! uploading ──▶ processing ──▶ successful
//!                         └──▶ failed
//! ```
//!
//! Transitions are forward-only. `successful` and `failed` are terminal; the only
//! move allowed out of a terminal state is an idempotent rewrite of the same state,
//! which lets a duplicate queue delivery re-record the outcome it already produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created; waiting for the client to upload the input file.
    Uploading,
    /// Upload confirmed; a work message has been (or is being) enqueued.
    Processing,
    /// Separation finished and the output blob is available.
    Successful,
    /// Processing was attempted and failed.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Uploading,
        JobStatus::Processing,
        JobStatus::Successful,
        JobStatus::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploading" => Some(Self::Uploading),
            "processing" => Some(Self::Processing),
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    /// Position along the lifecycle; terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Uploading => 0,
            Self::Processing => 1,
            Self::Successful | Self::Failed => 2,
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (Self::Uploading, Self::Processing)
                | (Self::Processing, Self::Successful)
                | (Self::Processing, Self::Failed)
                | (Self::Successful, Self::Successful)
                | (Self::Failed, Self::Failed)
        )
    }

    /// Every status from which a move to `self` is allowed.
    pub fn allowed_predecessors(self) -> &'static [JobStatus] {
        match self {
            Self::Uploading => &[],
            Self::Processing => &[Self::Uploading],
            Self::Successful => &[Self::Processing, Self::Successful],
            Self::Failed => &[Self::Processing, Self::Failed],
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested status move plus the fields that travel with it.
///
/// Constructed only through the named constructors so that `output_location`
/// exists exactly when the target is `successful` and `failure_reason` exactly
/// when the target is `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    to: JobStatus,
    output_location: Option<String>,
    failure_reason: Option<String>,
}

impl StatusChange {
    pub fn processing() -> Self {
        Self {
            to: JobStatus::Processing,
            output_location: None,
            failure_reason: None,
        }
    }

    pub fn successful(output_location: impl Into<String>) -> Self {
        Self {
            to: JobStatus::Successful,
            output_location: Some(output_location.into()),
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            to: JobStatus::Failed,
            output_location: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn to(&self) -> JobStatus {
        self.to
    }

    pub fn output_location(&self) -> Option<&str> {
        self.output_location.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}

/// A vocal-removal job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Locator of the uploaded source blob (`s3://bucket/key`).
    pub input_location: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new record in `uploading`.
    pub fn new(id: JobId, input_location: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            input_location: input_location.into(),
            status: JobStatus::Uploading,
            output_location: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, enforcing the state machine.
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, change: &StatusChange, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(change.to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: change.to,
            });
        }

        self.status = change.to;
        self.output_location = change.output_location.clone();
        self.failure_reason = change.failure_reason.clone();
        self.updated_at = now;
        Ok(())
    }
}
