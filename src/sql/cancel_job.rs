use chrono::{DateTime, Utc};
use courier_job::JobType;
use indoc::indoc;
use sqlx::{query, SqliteExecutor};

use crate::errors::Result;

/// Flags a pending or running job as cancelled. Returns `false` when there is
/// nothing left to cancel.
pub async fn cancel_job<'e>(
    executor: impl SqliteExecutor<'e>,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = query(indoc! {r#"
        update jobs
            set cancelled = 1, updated_at = ?2
            where id = ?1 and state in ('ready', 'running', 'retrying') and cancelled = 0
    "#})
    .bind(job_id)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Flags every pending or running job of one lane as cancelled.
pub async fn cancel_partition<'e>(
    executor: impl SqliteExecutor<'e>,
    job_type: JobType,
    partition_key: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = query(indoc! {r#"
        update jobs
            set cancelled = 1, updated_at = ?3
            where job_type = ?1
                and partition_key = ?2
                and state in ('ready', 'running', 'retrying')
                and cancelled = 0
    "#})
    .bind(job_type.as_str())
    .bind(partition_key)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Deletes the cancelled records of `job_type` nobody is running.
pub async fn discard_cancelled_jobs<'e>(
    executor: impl SqliteExecutor<'e>,
    job_type: JobType,
) -> Result<u64> {
    let result = query(indoc! {r#"
        delete from jobs
            where job_type = ?1
                and cancelled = 1
                and state in ('ready', 'retrying')
    "#})
    .bind(job_type.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Deletes `failed` and `done` records. With no ids, every such record goes.
pub async fn purge_jobs<'e>(
    executor: impl SqliteExecutor<'e>,
    job_ids: Option<&[String]>,
) -> Result<u64> {
    let result = query(indoc! {r#"
        delete from jobs
            where state in ('failed', 'done')
                and (?1 is null or id in (select value from json_each(?1)))
    "#})
    .bind(job_ids.map(serde_json::to_string).transpose()?)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
