use sqlx::{PgPool, Row};

use crate::models::detection::DetectionResult;
use crate::models::job::Job;

/// Insert a new pending job. Jobs are normally created by the API server;
/// the worker only uses this for local setup and tests.
pub async fn create_job(pool: &PgPool, image_id: Option<i64>) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (image_id, status)
        VALUES ($1, 'pending')
        RETURNING job_id, status, started_at, finished_at, error_message
        "#,
    )
    .bind(image_id)
    .fetch_one(pool)
    .await
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r#"
        SELECT job_id, status, started_at, finished_at, error_message
        FROM jobs
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Number of result rows stored for a job (0 or 1).
pub async fn count_results(pool: &PgPool, job_id: i64) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM analysis_results WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    row.try_get("n")
}

/// Claim a job for processing. Returns false when the job is missing or
/// already terminal.
pub async fn mark_processing(pool: &PgPool, job_id: i64) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'processing', started_at = NOW()
        WHERE job_id = $1 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

/// Store the analysis result and complete the job in one transaction.
///
/// The status guard serializes concurrent completions on the job row: the
/// loser sees zero updated rows and nothing is written.
pub async fn complete_with_result(
    pool: &PgPool,
    job_id: i64,
    result: &DetectionResult,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', finished_at = NOW()
        WHERE job_id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO analysis_results
            (job_id, count_viable, count_apoptosis, count_other,
             avg_confidence_score, raw_data, summary_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job_id)
    .bind(as_column(result.counts.viable))
    .bind(as_column(result.counts.apoptosis))
    .bind(as_column(result.counts.other))
    .bind(result.average_confidence)
    .bind(result.raw_data())
    .bind(&result.summary)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Fail a job that is still processing.
pub async fn mark_failed(
    pool: &PgPool,
    job_id: i64,
    error_message: &str,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', finished_at = NOW(), error_message = $2
        WHERE job_id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(error_message)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

fn as_column(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}
