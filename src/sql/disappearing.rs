use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::{query_as, query_scalar, SqliteExecutor};

use crate::disappearing::{DisappearingConfig, PendingExpiration};
use crate::errors::Result;

/// Enables (`Some(duration_ms)`) or disables (`None`) disappearing messages and
/// bumps the version. A disabled configuration keeps its last duration.
pub async fn upsert_configuration<'e>(
    executor: impl SqliteExecutor<'e>,
    conversation_id: &str,
    duration_ms: Option<i64>,
    now: DateTime<Utc>,
) -> Result<DisappearingConfig> {
    let config = query_as(indoc! {r#"
        insert into disappearing_configs (conversation_id, enabled, duration_ms, version, updated_at)
        values (?1, ?2 is not null, ?2, 1, ?3)
        on conflict (conversation_id) do update
            set
                enabled = excluded.enabled,
                duration_ms = coalesce(excluded.duration_ms, disappearing_configs.duration_ms),
                version = disappearing_configs.version + 1,
                updated_at = excluded.updated_at
        returning *
    "#})
    .bind(conversation_id)
    .bind(duration_ms)
    .bind(now.timestamp_millis())
    .fetch_one(executor)
    .await?;

    Ok(config)
}

pub async fn get_configuration<'e>(
    executor: impl SqliteExecutor<'e>,
    conversation_id: &str,
) -> Result<Option<DisappearingConfig>> {
    let config = query_as("select * from disappearing_configs where conversation_id = ?1")
        .bind(conversation_id)
        .fetch_optional(executor)
        .await?;

    Ok(config)
}

/// Starts the expiration of a message with the duration its conversation has
/// right now.
///
/// Single conditional update: nothing happens when the expiration already
/// started or when the conversation has disappearing messages disabled.
pub async fn start_expiration<'e>(
    executor: impl SqliteExecutor<'e>,
    message_id: &str,
    started_at: DateTime<Utc>,
) -> Result<Option<PendingExpiration>> {
    let pending = query_as(indoc! {r#"
        update messages
            set
                expire_started_at = ?2,
                expires_at = ?2 + (
                    select c.duration_ms from disappearing_configs as c
                    where c.conversation_id = messages.conversation_id and c.enabled
                )
            where id = ?1
                and expire_started_at is null
                and exists (
                    select 1 from disappearing_configs as c
                    where c.conversation_id = messages.conversation_id and c.enabled
                )
            returning id as message_id, conversation_id, expires_at
    "#})
    .bind(message_id)
    .bind(started_at.timestamp_millis())
    .fetch_optional(executor)
    .await?;

    Ok(pending)
}

/// Every message with a deadline, expired or not.
pub async fn pending_expirations<'e>(
    executor: impl SqliteExecutor<'e>,
) -> Result<Vec<PendingExpiration>> {
    let pending = query_as(indoc! {r#"
        select id as message_id, conversation_id, expires_at
        from messages
        where expires_at is not null
        order by expires_at
    "#})
    .fetch_all(executor)
    .await?;

    Ok(pending)
}

/// Read messages of enabled conversations whose expiration never started.
pub async fn unstarted_read_messages<'e>(
    executor: impl SqliteExecutor<'e>,
) -> Result<Vec<(String, i64)>> {
    let messages = query_as(indoc! {r#"
        select m.id, m.read_at
        from messages as m
        join disappearing_configs as c on c.conversation_id = m.conversation_id
        where m.read_at is not null
            and m.expire_started_at is null
            and c.enabled
        order by m.read_at
    "#})
    .fetch_all(executor)
    .await?;

    Ok(messages)
}

pub async fn expired_conversations<'e>(
    executor: impl SqliteExecutor<'e>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let conversations = query_scalar(indoc! {r#"
        select distinct conversation_id
        from messages
        where expires_at <= ?1
        order by conversation_id
    "#})
    .bind(now.timestamp_millis())
    .fetch_all(executor)
    .await?;

    Ok(conversations)
}

/// Deletes the messages of one conversation whose deadline is reached.
pub async fn delete_expired<'e>(
    executor: impl SqliteExecutor<'e>,
    conversation_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let deleted = query_scalar(indoc! {r#"
        delete from messages
            where conversation_id = ?1 and expires_at <= ?2
            returning id
    "#})
    .bind(conversation_id)
    .bind(now.timestamp_millis())
    .fetch_all(executor)
    .await?;

    Ok(deleted)
}
