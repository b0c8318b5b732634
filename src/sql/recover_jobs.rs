use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::{query, SqliteExecutor};

use crate::errors::Result;

/// Demotes the `running` records whose lock was last refreshed before
/// `stale_before` back to `ready`.
///
/// A live worker refreshes the locks of the jobs it runs, so only records of
/// dead workers go stale. The interrupted attempt stays counted.
pub async fn release_orphaned_jobs<'e>(
    executor: impl SqliteExecutor<'e>,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = query(indoc! {r#"
        update jobs
            set state = 'ready', locked_by = null, locked_at = null, updated_at = ?2
            where state = 'running'
                and (locked_at is null or locked_at < ?1)
    "#})
    .bind(stale_before.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Marks the lock `worker_id` holds on a running job as fresh. Returns `false`
/// once the worker lost it.
pub async fn refresh_job_lock<'e>(
    executor: impl SqliteExecutor<'e>,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = query(indoc! {r#"
        update jobs
            set locked_at = ?3
            where id = ?1 and locked_by = ?2 and state = 'running'
    "#})
    .bind(job_id)
    .bind(worker_id)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Demotes the records claimed by the given (dead) workers back to `ready`.
pub async fn force_unlock_workers<'e>(
    executor: impl SqliteExecutor<'e>,
    worker_ids: &[String],
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = query(indoc! {r#"
        update jobs
            set state = 'ready', locked_by = null, locked_at = null, updated_at = ?2
            where state = 'running'
                and locked_by in (select value from json_each(?1))
    "#})
    .bind(serde_json::to_string(worker_ids)?)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
