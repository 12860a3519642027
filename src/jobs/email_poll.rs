use super::{AppContext, StoredFile};
use crate::background_job::{BackgroundJob, Concurrency};
use crate::errors::JobError;
use crate::object_store::attachment_key;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Two polls must never race on the same mailbox.
const POLL_EXCLUSION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Polls the e-mail transport, uploads every CSV attachment to the object
/// store, and spawns one [`super::CsvSplitJob`] per attachment.
///
/// A message is marked processed only once all of its attachments have been
/// uploaded and their split jobs enqueued. If anything fails mid-message, the
/// whole poll fails and is retried; messages finished before the failure stay
/// marked processed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EmailPollJob;

impl BackgroundJob for EmailPollJob {
    const JOB_NAME: &'static str = "email-poll";
    const DEDUPLICATED: bool = true;

    type Context = AppContext;

    fn concurrency(&self) -> Option<Concurrency> {
        Some(Concurrency::new("email-poll", POLL_EXCLUSION_WINDOW))
    }

    async fn run(&self, ctx: AppContext) -> Result<(), JobError> {
        let messages = ctx
            .transport
            .get_new_messages()
            .await
            .map_err(JobError::retryable)?;

        info!(count = messages.len(), "Fetched new messages");

        for message in messages {
            let mut enqueued = 0usize;

            for attachment in message.attachments.iter().filter(|a| a.is_csv()) {
                let name = attachment_key(Utc::now(), &attachment.filename);
                let object_key = ctx
                    .objects
                    .put(&name, &attachment.bytes)
                    .await
                    .map_err(JobError::retryable)?;

                let file = StoredFile {
                    email_id: message.id.clone(),
                    filename: attachment.filename.clone(),
                    sender: message.from.clone(),
                    subject: message.subject.clone(),
                    received_at: message.received_at,
                    object_key,
                };

                let split_job = super::CsvSplitJob::new(file)
                    .enqueue(&ctx.jobs)
                    .await
                    .map_err(JobError::retryable)?;
                debug!(job.id = ?split_job, file = %attachment.filename, "Split job enqueued");
                enqueued += 1;
            }

            ctx.transport
                .mark_processed(&message.id)
                .await
                .map_err(JobError::retryable)?;

            info!(email = %message.id, attachments = enqueued, "Message processed");
        }

        Ok(())
    }
}
