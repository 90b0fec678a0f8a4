use async_trait::async_trait;
use sqlx::PgPool;

use super::queries;
use crate::models::detection::DetectionResult;
use crate::models::job::JobStatus;

/// Persistence of job lifecycle transitions and results.
///
/// Terminal transitions are exclusive per job: of two concurrent
/// `complete_with_result` calls for the same job at most one succeeds, the
/// other gets [`StoreError::Precondition`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// `pending | processing -> processing`, stamping `started_at`.
    async fn mark_processing(&self, job_id: i64) -> Result<(), StoreError>;

    /// Write the result and move `processing -> completed` atomically.
    async fn complete_with_result(
        &self,
        job_id: i64,
        result: &DetectionResult,
    ) -> Result<(), StoreError>;

    /// `processing -> failed` with a human-readable reason.
    async fn mark_failed(&self, job_id: i64, error_message: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("job {job_id} is not in the expected state ({expected})")]
    Precondition { job_id: i64, expected: JobStatus },
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn guard(transitioned: bool, job_id: i64, expected: JobStatus) -> Result<(), StoreError> {
    if transitioned {
        Ok(())
    } else {
        Err(StoreError::Precondition { job_id, expected })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn mark_processing(&self, job_id: i64) -> Result<(), StoreError> {
        let claimed = queries::mark_processing(&self.pool, job_id).await?;
        guard(claimed, job_id, JobStatus::Pending)
    }

    async fn complete_with_result(
        &self,
        job_id: i64,
        result: &DetectionResult,
    ) -> Result<(), StoreError> {
        let completed = queries::complete_with_result(&self.pool, job_id, result).await?;
        guard(completed, job_id, JobStatus::Processing)
    }

    async fn mark_failed(&self, job_id: i64, error_message: &str) -> Result<(), StoreError> {
        let failed = queries::mark_failed(&self.pool, job_id, error_message).await?;
        guard(failed, job_id, JobStatus::Processing)
    }
}
