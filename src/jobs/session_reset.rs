use courier_job::SessionReset;
use serde::Serialize;
use tracing::info;

use crate::context::JobContext;
use crate::errors::{CourierError, JobError};

#[derive(Serialize)]
struct EndSession<'a> {
    conversation_id: &'a str,
    end_session: bool,
}

/// Archives the session with the recipient and tells them to start a new one.
pub(crate) async fn run(ctx: &JobContext, payload: SessionReset) -> Result<(), JobError> {
    let collaborators = ctx.collaborators();

    collaborators
        .cipher
        .archive_session(&payload.recipient)
        .await?;
    ctx.check_cancelled().await?;

    let body = serde_json::to_vec(&EndSession {
        conversation_id: &payload.conversation_id,
        end_session: true,
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

    info!(recipient = %payload.recipient, "Session reset sent");
    Ok(())
}
