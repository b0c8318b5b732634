use courier_job::{IncomingContactSync, IncomingGroupSync};

use crate::context::JobContext;
use crate::errors::JobError;

pub(crate) async fn run_group_sync(
    ctx: &JobContext,
    payload: IncomingGroupSync,
) -> Result<(), JobError> {
    ctx.collaborators()
        .sync
        .apply_group_sync(&payload.data)
        .await?;
    ctx.check_cancelled().await
}

pub(crate) async fn run_contact_sync(
    ctx: &JobContext,
    payload: IncomingContactSync,
) -> Result<(), JobError> {
    ctx.collaborators()
        .sync
        .apply_contact_sync(&payload.data, payload.is_complete)
        .await?;
    ctx.check_cancelled().await
}
