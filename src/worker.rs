use crate::errors::{JobError, StoreError};
use crate::job_registry::JobRegistry;
use crate::schema::JobRecord;
use crate::storage::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// Backoff before re-attempting a job whose concurrency lock is held
/// elsewhere. The deferral does not count as an attempt.
const CONCURRENCY_BACKOFF: Duration = Duration::from_secs(5);

/// Exclusion window used when a record carries a key without a window.
const DEFAULT_EXCLUSION_WINDOW: Duration = Duration::from_secs(300);

pub(crate) struct Worker<Context> {
    pub(crate) store: JobStore,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) queue_name: String,
    pub(crate) worker_token: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) lease_ttl: Duration,
    pub(crate) default_retry_delays_secs: Arc<Vec<u64>>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// The wall-clock budget a handler gets: the lease TTL minus a safety
    /// margin, so results are always written under a live lease.
    fn handler_deadline(&self) -> Duration {
        let margin = (self.lease_ttl / 4).min(Duration::from_secs(5));
        self.lease_ttl
            .saturating_sub(margin)
            .max(Duration::from_millis(100))
    }

    /// Run background jobs until shut down, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        "No pending background worker jobs found. Polling again in {sleep_duration:?}…",
                    );
                    self.idle(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    self.idle(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    async fn idle(&self, duration: Duration) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = sleep(duration) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was claimed (run or deferred)
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error retrieving the job
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        trace!("Looking for next background worker job…");

        let queues = [self.queue_name.clone()];
        let Some(job) = self
            .store
            .fetch_ready_job(&queues, &self.worker_token, self.lease_ttl)
            .await?
        else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, job.job_type = %job.job_type);
        let job_id = job.id;

        if let Some(key) = job.concurrency_key.as_deref() {
            let window = job
                .concurrency_ttl_secs
                .map(|secs| Duration::from_secs(secs.max(0) as u64))
                .unwrap_or(DEFAULT_EXCLUSION_WINDOW);

            if !self
                .store
                .try_acquire_lock(key, &self.worker_token, window)
                .await?
            {
                let _enter = span.enter();
                debug!(%key, "Concurrency lock is held elsewhere; deferring job…");
                self.defer(job_id).await;
                return Ok(Some(job_id));
            }
        }

        debug!("Running job…");
        let heartbeat = self.spawn_heartbeat(job_id);

        let result = self
            .execute(&job)
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        heartbeat.abort();

        let _enter = span.enter();
        match result {
            Ok(()) => match self.store.complete_job(job_id, &self.worker_token).await {
                Ok(()) => debug!("Job succeeded"),
                Err(StoreError::LeaseLost { .. }) => {
                    warn!("Lease was lost before completion; the job will run again");
                }
                Err(err) => return Err(err.into()),
            },
            Err(error) => self.record_failure(&job, &error).await?,
        }

        if let Some(key) = job.concurrency_key.as_deref() {
            self.store.release_lock(key, &self.worker_token).await?;
        }

        Ok(Some(job_id))
    }

    /// Run the handler under a deadline, catching panics, inside a sentry
    /// transaction.
    async fn execute(&self, job: &JobRecord) -> Result<(), JobError> {
        let context = self.context.clone();
        let registry = self.job_registry.clone();
        let data = job.data.clone();
        let job_type = job.job_type.clone();
        let deadline = self.handler_deadline();

        with_sentry_transaction(&job.job_type, || async move {
            let Some(registered) = registry.get(&job_type) else {
                return Err(JobError::fatal(anyhow!("Unknown job type {job_type}")));
            };

            let future = (registered.run)(context, data);
            match tokio::time::timeout(deadline, AssertUnwindSafe(future).catch_unwind()).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(JobError::retryable(try_to_extract_panic_info(&*panic))),
                Err(_) => Err(JobError::retryable(anyhow!(
                    "handler exceeded its {deadline:?} deadline"
                ))),
            }
        })
        .await
    }

    /// Translate a handler error into a scheduled retry or a terminal
    /// failure, honoring the per-handler retry schedule.
    async fn record_failure(&self, job: &JobRecord, error: &JobError) -> anyhow::Result<()> {
        let delays = self
            .job_registry
            .get(&job.job_type)
            .and_then(|registered| registered.retry_delays_secs)
            .map(<[u64]>::to_vec)
            .unwrap_or_else(|| self.default_retry_delays_secs.as_ref().clone());

        // `attempts` counts failures recorded so far, so it doubles as the
        // index into the delay schedule for this failure.
        let failures = usize::try_from(job.attempts).unwrap_or(usize::MAX);

        let retry_at = if error.is_retryable() {
            delays
                .get(failures)
                .map(|secs| Utc::now() + chrono::Duration::seconds(*secs as i64))
        } else {
            None
        };

        match retry_at {
            Some(at) => warn!(%error, retry_at = %at, "Job failed; retry scheduled"),
            None => warn!(%error, "Job failed terminally; routing to the failed queue"),
        }

        match self
            .store
            .fail_job(job.id, &self.worker_token, &error.to_string(), retry_at)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::LeaseLost { .. }) => {
                warn!("Lease was lost before the failure could be recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn defer(&self, job_id: i64) {
        let until = Utc::now() + chrono::Duration::seconds(CONCURRENCY_BACKOFF.as_secs() as i64);
        if let Err(error) = self.store.defer_job(job_id, &self.worker_token, until).await {
            warn!(%error, "Failed to defer job");
        }
    }

    fn spawn_heartbeat(&self, job_id: i64) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let owner = self.worker_token.clone();
        let lease_ttl = self.lease_ttl;
        let period = (lease_ttl / 3).max(Duration::from_millis(50));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.extend_lease(job_id, &owner, lease_ttl).await {
                    Ok(true) => trace!(job.id = job_id, "Lease extended"),
                    Ok(false) => {
                        warn!(job.id = job_id, "Lease is no longer held; stopping heartbeat");
                        break;
                    }
                    Err(error) => warn!(job.id = job_id, %error, "Failed to extend lease"),
                }
            }
        })
    }
}
