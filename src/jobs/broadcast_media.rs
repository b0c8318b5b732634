use courier_job::{BroadcastMedia, JobPayload, JobType, SendOutgoing};
use courier_job_spec::JobSpec;
use tracing::info;

use crate::context::JobContext;
use crate::disappearing::{MessageDirection, NewMessage};
use crate::errors::{CourierError, JobError};
use crate::sql::add_job::add_job;
use crate::sql::messages::insert_message;

/// Uploads the attachments once, then stores one outgoing message per recipient
/// and queues its send job, all in one transaction.
pub(crate) async fn run(ctx: &JobContext, payload: BroadcastMedia) -> Result<(), JobError> {
    let uploader = &ctx.collaborators().uploader;

    let mut attachments = Vec::with_capacity(payload.attachment_ids.len());
    for attachment_id in &payload.attachment_ids {
        attachments.push(uploader.upload(attachment_id).await?);
        ctx.check_cancelled().await?;
    }

    let now = ctx.clock().now();
    let mut tx = ctx.pool().begin().await.map_err(CourierError::from)?;
    for message in &payload.messages {
        insert_message(
            &mut *tx,
            &NewMessage {
                id: message.message_id.clone(),
                conversation_id: message.conversation_id.clone(),
                direction: MessageDirection::Outgoing,
                body: message.body.clone(),
                created_at: now,
            },
        )
        .await?;

        let send = JobPayload::SendOutgoing(SendOutgoing {
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            recipient: message.recipient.clone(),
            body: message.body.clone(),
            attachments: attachments.clone(),
        });
        let spec = JobSpec::builder()
            .job_key(format!("broadcast:{}:{}", ctx.job().id(), message.message_id))
            .build();
        add_job(&mut *tx, &send, &spec, now).await?;
    }
    tx.commit().await.map_err(CourierError::from)?;

    info!(
        attachments = attachments.len(),
        messages = payload.messages.len(),
        "Media broadcast queued"
    );
    ctx.signals().notify(JobType::SendOutgoing);
    Ok(())
}
