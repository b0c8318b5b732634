use chrono::{DateTime, Utc};
use courier_job::{DbJob, Job, JobPayload, DEFAULT_MAX_ATTEMPTS};
use courier_job_spec::JobSpec;
use indoc::indoc;
use sqlx::{query, query_as, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::Result;

/// Inserts a job and its dependencies.
///
/// Runs on the caller's connection so producers can add jobs inside the same
/// transaction as the event that produced them. Returns `None` when the spec's
/// `job_key` is already taken by another record.
pub async fn add_job(
    conn: &mut SqliteConnection,
    payload: &JobPayload,
    spec: &JobSpec,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let id = Uuid::now_v7().to_string();
    let job_type = payload.job_type();
    let partition_key = spec
        .partition_key()
        .clone()
        .unwrap_or_else(|| payload.partition_key());
    let run_at = spec.run_at().unwrap_or(now);
    let max_attempts = spec.max_attempts().unwrap_or(DEFAULT_MAX_ATTEMPTS);

    let db_job: Option<DbJob> = query_as(indoc! {r#"
        insert into jobs (
            id, job_key, job_type, partition_key, payload,
            state, attempts, max_attempts, run_at, created_at, updated_at
        )
        values (?1, ?2, ?3, ?4, ?5, 'ready', 0, ?6, ?7, ?8, ?8)
        on conflict (job_key) do nothing
        returning *
    "#})
    .bind(&id)
    .bind(spec.job_key())
    .bind(job_type.as_str())
    .bind(&partition_key)
    .bind(serde_json::to_string(payload)?)
    .bind(max_attempts)
    .bind(run_at.timestamp_millis())
    .bind(now.timestamp_millis())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(db_job) = db_job else {
        debug!(
            job_type = %job_type,
            job_key = ?spec.job_key(),
            "Job key already taken, skipping"
        );
        return Ok(None);
    };

    for depends_on in spec.depends_on() {
        query("insert or ignore into job_dependencies (job_id, depends_on) values (?1, ?2)")
            .bind(&id)
            .bind(depends_on)
            .execute(&mut *conn)
            .await?;
    }

    let job = Job::try_from(db_job)?;
    info!(
        job_id = %job.id(),
        job_type = %job_type,
        partition = %job.partition_key(),
        "Job added to queue"
    );

    Ok(Some(job))
}
