use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of an analysis job, stored as the `job_status` enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, strum::Display,
)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Row of the `jobs` table, restricted to the columns the worker touches.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Job notification delivered by the broker.
///
/// Publishers send the artifact locator as `s3_key`; `artifact_key` is
/// accepted as well and wins when a body carries both. A body with neither
/// decodes to an empty key and fails validation. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(from = "WireMessage")]
pub struct JobMessage {
    #[garde(range(min = 1))]
    pub job_id: i64,

    #[garde(length(min = 1))]
    pub artifact_key: String,
}

#[derive(Deserialize)]
struct WireMessage {
    job_id: i64,
    #[serde(default)]
    artifact_key: Option<String>,
    #[serde(default)]
    s3_key: Option<String>,
}

impl From<WireMessage> for JobMessage {
    fn from(wire: WireMessage) -> Self {
        Self {
            job_id: wire.job_id,
            artifact_key: wire.artifact_key.or(wire.s3_key).unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid job message payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job message failed validation: {0}")]
    Invalid(#[from] garde::Report),
}

impl JobMessage {
    /// Decode and validate a raw delivery body.
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        let message: JobMessage = serde_json::from_slice(body)?;
        message.validate()?;
        Ok(message)
    }
}
