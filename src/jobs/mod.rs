//! Job bodies, one module per job kind.
//!
//! Each body returns a [`JobError`] whose variant tells the runner what to do with
//! the record. Bodies that call collaborators check for cancellation after every
//! call so a cancelled job stops before its next side effect.

mod broadcast_media;
mod content;
mod decrypt;
mod send;
mod session_reset;
mod sync;

use courier_job::JobPayload;
use tracing::debug;

use crate::context::JobContext;
use crate::errors::JobError;

pub(crate) async fn run_job_body(ctx: JobContext) -> Result<(), JobError> {
    let payload = ctx.job().payload().clone();
    debug!(job_id = %ctx.job().id(), job_type = %payload.job_type(), "Running job body");

    match payload {
        JobPayload::DecryptIncoming(payload) => decrypt::run(&ctx, payload).await,
        JobPayload::MessageContent(payload) => content::run(&ctx, payload).await,
        JobPayload::IncomingGroupSync(payload) => sync::run_group_sync(&ctx, payload).await,
        JobPayload::IncomingContactSync(payload) => sync::run_contact_sync(&ctx, payload).await,
        JobPayload::SessionReset(payload) => session_reset::run(&ctx, payload).await,
        JobPayload::SendOutgoing(payload) => send::run(&ctx, payload).await,
        JobPayload::BroadcastMedia(payload) => broadcast_media::run(&ctx, payload).await,
    }
}
