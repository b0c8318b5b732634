use getset::Getters;
use indoc::indoc;
use sqlx::{query_as, FromRow, SqliteExecutor};

use crate::errors::Result;

/// Number of records per job type and state.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct QueueCount {
    job_type: String,
    state: String,
    count: i64,
}

pub async fn job_counts<'e>(executor: impl SqliteExecutor<'e>) -> Result<Vec<QueueCount>> {
    let counts = query_as(indoc! {r#"
        select job_type, state, count(*) as count
        from jobs
        group by job_type, state
        order by job_type, state
    "#})
    .fetch_all(executor)
    .await?;

    Ok(counts)
}
