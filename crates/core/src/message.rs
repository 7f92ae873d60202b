//! Work message envelope carried by the work queue.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::JobId;
use crate::location::BlobLocation;

/// Request to process one job: `{"job_id": "...", "input_location": "s3://..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub job_id: JobId,
    pub input_location: String,
}

impl WorkMessage {
    pub fn new(job_id: JobId, input_location: impl Into<String>) -> Self {
        Self {
            job_id,
            input_location: input_location.into(),
        }
    }

    /// Serialize to the JSON text body sent over the queue.
    pub fn to_body(&self) -> String {
        serde_json::json!({
            "job_id": self.job_id.to_string(),
            "input_location": self.input_location,
        })
        .to_string()
    }

    /// Parse a queue body; any shape mismatch is a validation error.
    pub fn from_body(body: &str) -> Result<Self, DomainError> {
        serde_json::from_str(body)
            .map_err(|e| DomainError::validation(format!("malformed work message: {e}")))
    }

    pub fn input(&self) -> Result<BlobLocation, DomainError> {
        self.input_location.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_matches_wire_shape() {
        let id = JobId::new();
        let msg = WorkMessage::new(id, format!("s3://input/track_{id}"));

        let value: serde_json::Value = serde_json::from_str(&msg.to_body()).unwrap();
        assert_eq!(value["job_id"], id.to_string());
        assert_eq!(value["input_location"], format!("s3://input/track_{id}"));
        assert_eq!(WorkMessage::from_body(&msg.to_body()).unwrap(), msg);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        for body in [
            "",
            "not json",
            r#"{"job_id": "nope", "input_location": "s3://a/b"}"#,
            r#"{"input_location": "s3://a/b"}"#,
        ] {
            assert!(matches!(
                WorkMessage::from_body(body),
                Err(DomainError::Validation(_))
            ));
        }
    }
}
