use chrono::{DateTime, Utc};
use courier_job::{Job, JobType};
use indoc::indoc;
use sqlx::{query, query_scalar, SqliteConnection};

use crate::errors::Result;

/// Releases a successful job: deleted, or kept as `done` when `keep_completed`.
///
/// Only the worker holding the lock can release it. Returns the job types of
/// dependents that became runnable.
#[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="sqlite"))]
pub async fn complete_job(
    conn: &mut SqliteConnection,
    job: &Job,
    worker_id: &str,
    keep_completed: bool,
    now: DateTime<Utc>,
) -> Result<Vec<JobType>> {
    let result = if keep_completed {
        query(indoc! {r#"
            update jobs
                set state = 'done', locked_by = null, locked_at = null, updated_at = ?3
                where id = ?1 and locked_by = ?2
        "#})
        .bind(job.id())
        .bind(worker_id)
        .bind(now.timestamp_millis())
        .execute(&mut *conn)
        .await?
    } else {
        query("delete from jobs where id = ?1 and locked_by = ?2")
            .bind(job.id())
            .bind(worker_id)
            .execute(&mut *conn)
            .await?
    };

    if result.rows_affected() == 0 {
        return Ok(Vec::new());
    }

    wake_dependents(conn, job.id(), now).await
}

/// Removes a job without running it again nor reporting it. Used for cancelled
/// jobs and for terminal-but-silent outcomes.
pub async fn discard_job(
    conn: &mut SqliteConnection,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<JobType>> {
    let result = query("delete from jobs where id = ?1 and locked_by = ?2")
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(Vec::new());
    }

    wake_dependents(conn, job_id, now).await
}

/// Lifts the dependency wait of the records depending on `job_id` and returns
/// their job types. Their `run_at` is untouched, a dependent scheduled for later
/// still waits for it.
pub(crate) async fn wake_dependents(
    conn: &mut SqliteConnection,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<JobType>> {
    let job_types: Vec<String> = query_scalar(indoc! {r#"
        update jobs
            set deferred_until = null, updated_at = ?2
            where state in ('ready', 'retrying')
                and deferred_until is not null
                and id in (select job_id from job_dependencies where depends_on = ?1)
            returning job_type
    "#})
    .bind(job_id)
    .bind(now.timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;

    let mut job_types: Vec<JobType> = job_types
        .iter()
        .filter_map(|job_type| job_type.parse().ok())
        .collect();
    job_types.sort();
    job_types.dedup();

    Ok(job_types)
}
