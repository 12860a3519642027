use std::fmt;

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The backing store rejected the operation.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Error type for Job Store mutations performed by the worker runtime
/// and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's lease on the job is no longer valid. The job record was
    /// not mutated; another worker (or the lease reaper) owns it now.
    #[error("lease owner mismatch for job {job_id}: no longer held by {owner}")]
    LeaseLost {
        /// The job whose lease was lost.
        job_id: i64,
        /// The token that tried to mutate the record.
        owner: String,
    },

    /// No job record exists under the given id.
    #[error("job {0} not found")]
    JobNotFound(i64),

    /// The backing store rejected the operation.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Failure returned by a job handler.
///
/// Handlers signal retryability explicitly instead of raising: the worker
/// runtime translates a retryable error into a scheduled retry and a fatal
/// one into an immediate move to the `failed` queue.
pub struct JobError {
    retryable: bool,
    source: anyhow::Error,
}

impl JobError {
    /// A transient failure; the job will be retried on its schedule.
    pub fn retryable(source: impl Into<anyhow::Error>) -> Self {
        Self {
            retryable: true,
            source: source.into(),
        }
    }

    /// A permanent failure; the job goes straight to the `failed` queue.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            retryable: false,
            source: source.into(),
        }
    }

    /// Whether the worker runtime should schedule a retry.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl fmt::Debug for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobError")
            .field("retryable", &self.retryable)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn retryability_is_preserved() {
        assert!(JobError::retryable(anyhow!("boom")).is_retryable());
        assert!(!JobError::fatal(anyhow!("boom")).is_retryable());
    }

    #[test]
    fn display_shows_the_cause() {
        let err = JobError::fatal(anyhow!("malformed header"));
        assert_eq!(err.to_string(), "malformed header");
    }
}
