use chrono::{DateTime, Utc};
use courier_clock::from_millis;
use courier_job::{DbJob, Job, JobType};
use indoc::{formatdoc, indoc};
use sqlx::{query_as, query_scalar, SqliteExecutor};
use tracing::warn;

use crate::errors::Result;
use crate::operation::{Dependency, DependencyState};

/// A record is the head of its lane when no earlier record of the same
/// `(job_type, partition_key)` is still waiting or running. Failed, done and
/// cancelled records never block their lane.
const LANE_HEAD: &str = indoc! {r#"
    not exists (
        select 1 from jobs as earlier
        where earlier.job_type = jobs.job_type
            and earlier.partition_key = jobs.partition_key
            and earlier.sort_key < jobs.sort_key
            and earlier.state in ('ready', 'running', 'retrying')
            and earlier.cancelled = 0
    )
"#};

/// Rows that failed to decode are returned apart so the caller can fail them.
pub struct ReadyJobs {
    pub jobs: Vec<Job>,
    pub undecodable: Vec<(String, String)>,
}

/// Returns up to `limit` runnable records of `job_type` in ascending sort-key
/// order, at most one per partition.
pub async fn fetch_ready<'e>(
    executor: impl SqliteExecutor<'e>,
    job_type: JobType,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<ReadyJobs> {
    let sql = formatdoc!(
        r#"
            select * from jobs
            where job_type = ?1
                and state in ('ready', 'retrying')
                and run_at <= ?2
                and (deferred_until is null or deferred_until <= ?2)
                and cancelled = 0
                and {LANE_HEAD}
            order by sort_key asc
            limit ?3
        "#
    );

    let rows: Vec<DbJob> = query_as(&sql)
        .bind(job_type.as_str())
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(executor)
        .await?;

    let mut ready = ReadyJobs {
        jobs: Vec::with_capacity(rows.len()),
        undecodable: Vec::new(),
    };
    for row in rows {
        let job_id = row.id().clone();
        match Job::try_from(row) {
            Ok(job) => ready.jobs.push(job),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not decode job record");
                ready.undecodable.push((job_id, e.to_string()));
            }
        }
    }

    Ok(ready)
}

/// Claims a record for `worker_id`: `ready|retrying → running`, attempts + 1.
///
/// The transition is a single conditional update, so when several workers race
/// for the same record exactly one gets `Some`.
pub async fn claim_job<'e>(
    executor: impl SqliteExecutor<'e>,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let sql = formatdoc!(
        r#"
            update jobs
                set
                    state = 'running',
                    attempts = attempts + 1,
                    locked_by = ?2,
                    locked_at = ?3,
                    deferred_until = null,
                    updated_at = ?3
                where id = ?1
                    and state in ('ready', 'retrying')
                    and run_at <= ?3
                    and (deferred_until is null or deferred_until <= ?3)
                    and cancelled = 0
                    and {LANE_HEAD}
                returning *
        "#
    );

    let row: Option<DbJob> = query_as(&sql)
        .bind(job_id)
        .bind(worker_id)
        .bind(now.timestamp_millis())
        .fetch_optional(executor)
        .await?;

    Ok(row.map(Job::try_from).transpose()?)
}

/// Earliest future time a waiting record of `job_type` becomes due (its `run_at`,
/// or later when it waits on dependencies), used to arm the idle wait. Records already due are behind their lane head, the runner
/// reaches them when the head is released or at the next poll.
pub async fn next_run_at<'e>(
    executor: impl SqliteExecutor<'e>,
    job_type: JobType,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let next: Option<i64> = query_scalar(indoc! {r#"
        select min(max(run_at, coalesce(deferred_until, run_at))) from jobs
        where job_type = ?1
            and state in ('ready', 'retrying')
            and max(run_at, coalesce(deferred_until, run_at)) > ?2
            and cancelled = 0
    "#})
    .bind(job_type.as_str())
    .bind(now.timestamp_millis())
    .fetch_one(executor)
    .await?;

    Ok(next.map(from_millis))
}

/// States of the jobs `job_id` depends on. A dependency with no record left has
/// completed and been deleted.
pub async fn dependency_states<'e>(
    executor: impl SqliteExecutor<'e>,
    job_id: &str,
) -> Result<Vec<Dependency>> {
    let rows: Vec<(String, Option<String>)> = query_as(indoc! {r#"
        select d.depends_on, jobs.state
        from job_dependencies as d
        left join jobs on jobs.id = d.depends_on
        where d.job_id = ?1
        order by d.depends_on
    "#})
    .bind(job_id)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(job_id, state)| Dependency {
            job_id,
            state: match state.as_deref() {
                None | Some("done") => DependencyState::Done,
                Some("failed") => DependencyState::Failed,
                Some(_) => DependencyState::Pending,
            },
        })
        .collect())
}

/// Pushes back an unclaimed record whose dependencies are not met until
/// `deferred_until`, or until a dependency is released. `run_at` is left as the
/// producer set it and no attempt is used.
pub async fn defer_job<'e>(
    executor: impl SqliteExecutor<'e>,
    job_id: &str,
    deferred_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(indoc! {r#"
        update jobs
            set deferred_until = ?2, updated_at = ?3
            where id = ?1 and state in ('ready', 'retrying') and locked_by is null
    "#})
    .bind(job_id)
    .bind(deferred_until.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_job_by_id<'e>(executor: impl SqliteExecutor<'e>, job_id: &str) -> Result<Option<Job>> {
    let row: Option<DbJob> = query_as("select * from jobs where id = ?1")
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(Job::try_from).transpose()?)
}

/// `None` when the record is gone, which callers treat as cancelled.
pub async fn is_cancelled<'e>(executor: impl SqliteExecutor<'e>, job_id: &str) -> Result<Option<bool>> {
    let cancelled: Option<bool> = query_scalar("select cancelled from jobs where id = ?1")
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    Ok(cancelled)
}
