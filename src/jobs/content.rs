use std::time::Duration;

use courier_clock::from_millis;
use courier_job::{Content, MessageContent};
use tracing::{debug, info};

use crate::context::JobContext;
use crate::disappearing::{MessageDirection, NewMessage};
use crate::errors::JobError;
use crate::sql::messages::insert_message;

pub(crate) async fn run(ctx: &JobContext, payload: MessageContent) -> Result<(), JobError> {
    match payload.content {
        Content::Data {
            conversation_id,
            body,
        } => {
            let message = NewMessage {
                id: payload.envelope_id,
                conversation_id,
                direction: MessageDirection::Incoming,
                body,
                created_at: from_millis(payload.timestamp),
            };
            if insert_message(ctx.pool(), &message).await? {
                info!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "Incoming message stored"
                );
            } else {
                debug!(message_id = %message.id, "Incoming message already stored");
            }
            Ok(())
        }
        Content::ExpirationTimerUpdate {
            conversation_id,
            duration_ms,
        } => {
            ctx.expirations()
                .set_configuration(&conversation_id, duration_ms.map(Duration::from_millis))
                .await?;
            Ok(())
        }
        Content::Empty => Ok(()),
        Content::GroupSync { .. } | Content::ContactSync { .. } => Err(JobError::terminal(
            "sync content belongs to the sync queues",
        )),
    }
}
