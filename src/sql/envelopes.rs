use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{query, query_scalar, SqliteExecutor};

use crate::errors::Result;

/// Which of `envelope_ids` were already processed.
pub async fn processed_envelope_ids<'e>(
    executor: impl SqliteExecutor<'e>,
    envelope_ids: &[String],
) -> Result<HashSet<String>> {
    if envelope_ids.is_empty() {
        return Ok(HashSet::new());
    }

    let ids: Vec<String> = query_scalar(
        "select envelope_id from processed_envelopes where envelope_id in (select value from json_each(?1))",
    )
    .bind(serde_json::to_string(envelope_ids)?)
    .fetch_all(executor)
    .await?;

    Ok(ids.into_iter().collect())
}

/// Records an envelope as processed. `false` means it already was.
pub async fn mark_envelope_processed<'e>(
    executor: impl SqliteExecutor<'e>,
    envelope_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = query(
        "insert or ignore into processed_envelopes (envelope_id, processed_at) values (?1, ?2)",
    )
    .bind(envelope_id)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}
