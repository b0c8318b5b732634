use courier_job::{AttachmentPointer, SendOutgoing};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::errors::{CourierError, JobError};

#[derive(Serialize)]
struct OutgoingBody<'a> {
    message_id: &'a str,
    conversation_id: &'a str,
    body: &'a str,
    attachments: &'a [AttachmentPointer],
}

/// Encrypts and sends one outgoing message. A sent message counts as read by its
/// author, so its expiration starts once the transport accepted it. Nothing after
/// the send can fail the job.
pub(crate) async fn run(ctx: &JobContext, payload: SendOutgoing) -> Result<(), JobError> {
    let collaborators = ctx.collaborators();

    let body = serde_json::to_vec(&OutgoingBody {
        message_id: &payload.message_id,
        conversation_id: &payload.conversation_id,
        body: &payload.body,
        attachments: &payload.attachments,
    })
    .map_err(CourierError::from)?;

    let ciphertext = collaborators
        .cipher
        .encrypt(&body, &payload.recipient)
        .await?;
    ctx.check_cancelled().await?;

    collaborators
        .transport
        .send(&payload.recipient, &ciphertext)
        .await?;

    info!(
        message_id = %payload.message_id,
        recipient = %payload.recipient,
        "Message sent"
    );

    // The message is out: failing the job now would send it twice. When the read
    // was recorded but the expiration did not start, the startup backfill starts it.
    if let Err(e) = ctx
        .expirations()
        .mark_read(&payload.message_id, ctx.clock().now())
        .await
    {
        warn!(
            message_id = %payload.message_id,
            error = %e,
            "Could not start the expiration of a sent message"
        );
    }
    Ok(())
}
