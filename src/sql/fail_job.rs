use chrono::{DateTime, Utc};
use courier_job::{Job, JobType};
use indoc::indoc;
use sqlx::{query, SqliteConnection, SqliteExecutor};

use crate::errors::Result;
use crate::sql::complete_job::wake_dependents;

/// Schedules the next attempt of a job that failed with a retryable error.
///
/// Returns `false` when the job was cancelled while it ran, or when this worker
/// no longer holds it. A cancelled job is never retried.
pub async fn retry_job<'e>(
    executor: impl SqliteExecutor<'e>,
    job: &Job,
    worker_id: &str,
    message: &str,
    run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = query(indoc! {r#"
        update jobs
            set
                state = 'retrying',
                last_error = ?3,
                run_at = ?4,
                locked_by = null,
                locked_at = null,
                updated_at = ?5
            where id = ?1 and locked_by = ?2 and cancelled = 0
    "#})
    .bind(job.id())
    .bind(worker_id)
    .bind(message)
    .bind(run_at.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Marks a claimed job `failed`. The record is kept until purged.
///
/// Returns `None` when nothing was failed: the job was cancelled while it ran,
/// or this worker no longer holds it. Cancelled jobs are never failed nor
/// reported.
pub async fn fail_job(
    conn: &mut SqliteConnection,
    job: &Job,
    worker_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Option<Vec<JobType>>> {
    let result = query(indoc! {r#"
        update jobs
            set
                state = 'failed',
                last_error = ?3,
                locked_by = null,
                locked_at = null,
                updated_at = ?4
            where id = ?1 and locked_by = ?2 and cancelled = 0
    "#})
    .bind(job.id())
    .bind(worker_id)
    .bind(message)
    .bind(now.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    wake_dependents(conn, job.id(), now).await.map(Some)
}

/// Hands a claimed job back without running it, to be looked at again after
/// `deferred_until`. The claim's attempt stays counted, attempts never decrease.
pub async fn release_blocked_job<'e>(
    executor: impl SqliteExecutor<'e>,
    job: &Job,
    worker_id: &str,
    deferred_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = query(indoc! {r#"
        update jobs
            set
                state = 'ready',
                deferred_until = ?3,
                locked_by = null,
                locked_at = null,
                updated_at = ?4
            where id = ?1 and locked_by = ?2
    "#})
    .bind(job.id())
    .bind(worker_id)
    .bind(deferred_until.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Marks a job `failed` without claiming it, for records that can never run:
/// undecodable payloads and failed dependencies. Returns `false` if another
/// worker got to the record first.
pub async fn fail_unclaimed_job(
    conn: &mut SqliteConnection,
    job_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(bool, Vec<JobType>)> {
    let result = query(indoc! {r#"
        update jobs
            set state = 'failed', last_error = ?2, updated_at = ?3
            where id = ?1 and state in ('ready', 'retrying') and locked_by is null
    "#})
    .bind(job_id)
    .bind(message)
    .bind(now.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok((false, Vec::new()));
    }

    let woken = wake_dependents(conn, job_id, now).await?;
    Ok((true, woken))
}
