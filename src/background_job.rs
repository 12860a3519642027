use crate::errors::{EnqueueError, JobError};
use crate::schema::NewJob;
use crate::storage::JobStore;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Queue that terminally failed jobs are routed to for inspection.
pub const FAILED_QUEUE: &str = "failed";

/// Built-in retry schedule: three attempts at 5, 10, and 15 minutes.
pub const DEFAULT_RETRY_DELAYS_SECS: &[u64] = &[300, 600, 900];

/// A named exclusion lock held for a bounded window.
///
/// While one job holds the lock, no other job with the same key may be
/// processing; blocked jobs are returned to the queue with a small backoff.
#[derive(Debug, Clone)]
pub struct Concurrency {
    /// Lock name, shared by all jobs that must not overlap.
    pub key: String,
    /// How long the lock may be held before it lapses on its own.
    pub window: Duration,
}

impl Concurrency {
    /// Create an exclusion over `key` for the given window.
    pub fn new(key: impl Into<String>, window: Duration) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }
}

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task.
    const PRIORITY: i16 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an unstarted
    /// job with the same data.
    const DEDUPLICATED: bool = false;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Per-handler retry schedule in seconds.
    ///
    /// `None` falls back to the runner-wide default. The number of entries
    /// bounds the number of retries; a job is attempted at most
    /// `delays.len() + 1` times before moving to the failed queue.
    const RETRY_DELAYS_SECS: Option<&'static [u64]> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// The exclusion lock this instance must hold while processing, if any.
    fn concurrency(&self) -> Option<Concurrency> {
        None
    }

    /// Execute the task. This method should define its logic.
    ///
    /// A returned [`JobError`] tells the worker runtime whether the failure
    /// is worth retrying.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = Result<(), JobError>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    #[instrument(name = "jobs.enqueue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(
        &'a self,
        store: &'a JobStore,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let new_job = match self.to_new_job() {
            Ok(job) => job,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        if Self::DEDUPLICATED {
            async move { store.enqueue_deduplicated(new_job).await }.boxed()
        } else {
            async move { Ok(Some(store.enqueue(new_job).await?)) }.boxed()
        }
    }

    /// Schedule this job to become runnable at `at`.
    #[instrument(name = "jobs.schedule", skip(self, store), fields(message = Self::JOB_NAME))]
    fn schedule_at<'a>(
        &'a self,
        store: &'a JobStore,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let new_job = match self.to_new_job() {
            Ok(job) => job,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        async move { store.schedule(new_job, at).await }.boxed()
    }

    /// Enqueue this job as a continuation of `parent_id`: it only becomes
    /// runnable once the parent job has succeeded.
    #[instrument(name = "jobs.continue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue_after<'a>(
        &'a self,
        store: &'a JobStore,
        parent_id: i64,
    ) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let new_job = match self.to_new_job() {
            Ok(job) => job,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        async move { store.enqueue_continuation(parent_id, new_job).await }.boxed()
    }

    /// The insertable form of this job instance.
    fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        let concurrency = self.concurrency();
        Ok(NewJob {
            queue: Self::QUEUE.to_string(),
            job_type: Self::JOB_NAME.to_string(),
            data: serde_json::to_value(self)?,
            priority: Self::PRIORITY,
            concurrency_key: concurrency.as_ref().map(|c| c.key.clone()),
            concurrency_ttl_secs: concurrency.map(|c| c.window.as_secs() as i64),
        })
    }
}
