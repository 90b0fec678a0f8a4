//! Per-delivery job execution: parse, claim, fetch, infer, persist.
//!
//! Every failure is contained here and turned into an [`Outcome`]; the
//! consumer only needs [`Outcome::disposition`] to settle the delivery.

use std::sync::Arc;
use std::time::Instant;

use crate::models::detection::DetectionResult;
use crate::models::job::JobMessage;
use crate::worker_state::WorkerState;

/// Longest error text written to `jobs.error_message`, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    MalformedMessage,
    StoreUnavailable,
    ArtifactFetchFailed,
    InferenceFailed,
}

/// Pipeline step a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    Parse,
    MarkProcessing,
    FetchArtifact,
    Inference,
    PersistResult,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} at {step}: {detail}")]
pub struct Failure {
    /// `None` when the message could not be parsed
    pub job_id: Option<i64>,
    pub kind: FailureKind,
    pub step: Step,
    pub detail: String,
}

impl Failure {
    fn new(job_id: Option<i64>, kind: FailureKind, step: Step, detail: impl ToString) -> Self {
        Self {
            job_id,
            kind,
            step,
            detail: detail.to_string(),
        }
    }

    /// Reason recorded on the failed job.
    pub fn job_error_message(&self) -> String {
        truncate_chars(&self.to_string(), MAX_ERROR_MESSAGE_CHARS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failure(Failure),
}

/// How the consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue; the broker may dead-letter it.
    Reject,
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Success => Disposition::Ack,
            Outcome::Failure(_) => Disposition::Reject,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Run one delivery body through the pipeline.
pub async fn execute(state: &WorkerState, body: &[u8]) -> Outcome {
    let message = match JobMessage::parse(body) {
        Ok(message) => message,
        Err(e) => {
            let failure = Failure::new(None, FailureKind::MalformedMessage, Step::Parse, e);
            tracing::error!(
                job_id = "unavailable",
                step = %failure.step,
                kind = %failure.kind,
                error = %failure.detail,
                "Rejecting malformed job message"
            );
            record_failure_metric(&failure);
            return Outcome::Failure(failure);
        }
    };

    let job_id = message.job_id;
    tracing::info!(
        job_id,
        artifact_key = %message.artifact_key,
        "Processing analysis job"
    );

    if let Err(e) = state.jobs.mark_processing(job_id).await {
        let failure = Failure::new(
            Some(job_id),
            FailureKind::StoreUnavailable,
            Step::MarkProcessing,
            e,
        );
        log_failure(&failure);
        record_failure_metric(&failure);
        return Outcome::Failure(failure);
    }

    let start = Instant::now();
    match run_job(state, &message).await {
        Ok(result) => {
            metrics::counter!("analysis_jobs_completed_total").increment(1);
            metrics::counter!("analysis_detections_total")
                .increment(u64::from(result.total_detections()));
            metrics::histogram!("analysis_job_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            tracing::info!(
                job_id,
                viable = result.counts.viable,
                apoptosis = result.counts.apoptosis,
                other = result.counts.other,
                average_confidence = result.average_confidence,
                duration_ms = start.elapsed().as_millis() as u64,
                "Job completed"
            );
            Outcome::Success
        }
        Err(failure) => {
            log_failure(&failure);
            record_failure_metric(&failure);
            record_job_failure(state, &failure).await;
            Outcome::Failure(failure)
        }
    }
}

/// Steps 3-5. Any error here leaves the job in `processing` until
/// [`record_job_failure`] moves it to `failed`.
async fn run_job(state: &WorkerState, message: &JobMessage) -> Result<DetectionResult, Failure> {
    let job_id = message.job_id;

    let artifact = state
        .storage
        .get(&message.artifact_key)
        .await
        .map_err(|e| {
            Failure::new(
                Some(job_id),
                FailureKind::ArtifactFetchFailed,
                Step::FetchArtifact,
                e,
            )
        })?;
    tracing::debug!(job_id, bytes = artifact.len(), "Artifact downloaded");

    let inference_failed = |e: &dyn std::fmt::Display| {
        Failure::new(
            Some(job_id),
            FailureKind::InferenceFailed,
            Step::Inference,
            e,
        )
    };
    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.infer(&artifact))
        .await
        .map_err(|e| inference_failed(&e))?
        .map_err(|e| inference_failed(&e))?;

    state
        .jobs
        .complete_with_result(job_id, &result)
        .await
        .map_err(|e| {
            Failure::new(
                Some(job_id),
                FailureKind::StoreUnavailable,
                Step::PersistResult,
                e,
            )
        })?;

    Ok(result)
}

/// Best-effort `failed` transition. A second failure is logged and dropped;
/// the delivery is rejected either way.
async fn record_job_failure(state: &WorkerState, failure: &Failure) {
    let Some(job_id) = failure.job_id else {
        return;
    };

    if let Err(e) = state
        .jobs
        .mark_failed(job_id, &failure.job_error_message())
        .await
    {
        tracing::error!(
            job_id,
            step = "mark_failed",
            kind = %failure.kind,
            error = %e,
            "Failed to record job failure"
        );
    }
}

fn log_failure(failure: &Failure) {
    tracing::error!(
        job_id = failure.job_id,
        step = %failure.step,
        kind = %failure.kind,
        error = %failure.detail,
        "Job step failed"
    );
}

fn record_failure_metric(failure: &Failure) {
    let kind: &'static str = failure.kind.into();
    metrics::counter!("analysis_jobs_failed_total", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition() {
        assert_eq!(Outcome::Success.disposition(), Disposition::Ack);
        let failure = Failure::new(Some(1), FailureKind::InferenceFailed, Step::Inference, "boom");
        assert_eq!(Outcome::Failure(failure).disposition(), Disposition::Reject);
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::new(
            Some(42),
            FailureKind::ArtifactFetchFailed,
            Step::FetchArtifact,
            "object not found: img/42.png",
        );
        assert_eq!(
            failure.to_string(),
            "artifact_fetch_failed at fetch_artifact: object not found: img/42.png"
        );
    }

    #[test]
    fn test_job_error_message_truncated() {
        let failure = Failure::new(
            Some(7),
            FailureKind::InferenceFailed,
            Step::Inference,
            "é".repeat(1000),
        );
        let message = failure.job_error_message();
        assert_eq!(message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert!(message.starts_with("inference_failed at inference: "));
    }

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_chars("short", 500), "short");
    }
}
