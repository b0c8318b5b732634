use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::{query, query_as, SqliteExecutor};

use crate::disappearing::{Message, NewMessage};
use crate::errors::Result;

/// Stores a message. Storing the same id twice is a no-op returning `false`.
pub async fn insert_message<'e>(
    executor: impl SqliteExecutor<'e>,
    message: &NewMessage,
) -> Result<bool> {
    let result = query(indoc! {r#"
        insert or ignore into messages (id, conversation_id, direction, body, created_at)
        values (?1, ?2, ?3, ?4, ?5)
    "#})
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(message.direction.as_str())
    .bind(&message.body)
    .bind(message.created_at.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Sets `read_at` once. Later reads keep the first timestamp.
pub async fn mark_read<'e>(
    executor: impl SqliteExecutor<'e>,
    message_id: &str,
    read_at: DateTime<Utc>,
) -> Result<bool> {
    let result = query("update messages set read_at = ?2 where id = ?1 and read_at is null")
        .bind(message_id)
        .bind(read_at.timestamp_millis())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Messages of a conversation whose deadline, if any, is still ahead of `now`.
pub async fn fetch_visible<'e>(
    executor: impl SqliteExecutor<'e>,
    conversation_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Message>> {
    let messages = query_as(indoc! {r#"
        select * from messages
        where conversation_id = ?1
            and (expires_at is null or expires_at > ?2)
        order by created_at, id
    "#})
    .bind(conversation_id)
    .bind(now.timestamp_millis())
    .fetch_all(executor)
    .await?;

    Ok(messages)
}

pub async fn get_visible_message<'e>(
    executor: impl SqliteExecutor<'e>,
    message_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Message>> {
    let message = query_as(
        "select * from messages where id = ?1 and (expires_at is null or expires_at > ?2)",
    )
    .bind(message_id)
    .bind(now.timestamp_millis())
    .fetch_optional(executor)
    .await?;

    Ok(message)
}
