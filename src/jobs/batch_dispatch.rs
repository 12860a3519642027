use super::{AppContext, StoredFile};
use crate::api_client::{BatchPayload, Row};
use crate::background_job::{BackgroundJob, Concurrency};
use crate::errors::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Batches of one e-mail never run in parallel, even if the continuation
/// chain were somehow violated.
const DISPATCH_EXCLUSION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Ships one batch of a file to the price API.
///
/// On the terminal batch of a file, a successful POST is followed by a
/// receipt to the original sender. Reply delivery is best-effort: a reply
/// failure is logged but never fails the batch, since re-sending the whole
/// batch would be the worse trade.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchDispatchJob {
    file: StoredFile,
    batch_number: usize,
    total_batches: usize,
    rows: Vec<Row>,
}

impl BatchDispatchJob {
    /// Batch `batch_number` of `total_batches` for the given file.
    pub fn new(file: StoredFile, batch_number: usize, total_batches: usize, rows: Vec<Row>) -> Self {
        Self {
            file,
            batch_number,
            total_batches,
            rows,
        }
    }

    /// Whether this is the final batch of its file.
    pub fn is_last(&self) -> bool {
        self.batch_number == self.total_batches
    }

    fn payload(&self) -> BatchPayload {
        BatchPayload {
            file_name: self.file.filename.clone(),
            sender_email: self.file.sender.clone(),
            subject: self.file.subject.clone(),
            received_at: self.file.received_at,
            data: self.rows.clone(),
            is_last: self.is_last(),
        }
    }

    fn reply_body(&self, completed_at: DateTime<Utc>) -> String {
        format!(
            "Your price list \"{}\" has been processed.\n\n\
             Batches delivered: {}\n\
             Completed at: {} UTC\n",
            self.file.filename,
            self.total_batches,
            completed_at.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

impl BackgroundJob for BatchDispatchJob {
    const JOB_NAME: &'static str = "batch-dispatch";

    type Context = AppContext;

    fn concurrency(&self) -> Option<Concurrency> {
        Some(Concurrency::new(
            format!("batch-dispatch:{}", self.file.email_id),
            DISPATCH_EXCLUSION_WINDOW,
        ))
    }

    async fn run(&self, ctx: AppContext) -> Result<(), JobError> {
        let response = ctx
            .api
            .send_batch(&self.payload())
            .await
            .map_err(JobError::retryable)?;

        if !response.success {
            return Err(JobError::retryable(anyhow::anyhow!(
                "api rejected batch {}/{} of {}: {}",
                self.batch_number,
                self.total_batches,
                self.file.filename,
                response.message.unwrap_or_default(),
            )));
        }

        info!(
            file = %self.file.filename,
            batch = self.batch_number,
            total = self.total_batches,
            "Batch delivered"
        );

        if self.is_last() {
            let body = self.reply_body(Utc::now());
            if let Err(error) = ctx.transport.send_reply(&self.file.email_id, &body).await {
                warn!(
                    %error,
                    email = %self.file.email_id,
                    "Reply delivery failed; the batch result stands"
                );
            }
        }

        Ok(())
    }
}
