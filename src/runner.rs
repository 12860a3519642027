use crate::background_job::DEFAULT_RETRY_DELAYS_SECS;
use crate::job_registry::JobRegistry;
use crate::storage::JobStore;
use crate::worker::Worker;
use crate::{BackgroundJob, DEFAULT_QUEUE};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: JobStore,
    queues: HashMap<String, Queue<Context, Configured>>,
    context: Context,
    shutdown_when_queue_empty: bool,
    lease_ttl: Duration,
    default_retry_delays_secs: Vec<u64>,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given job store and context.
    pub fn new(store: JobStore, context: Context) -> Self {
        Self {
            store,
            queues: HashMap::new(),
            context,
            shutdown_when_queue_empty: false,
            lease_ttl: DEFAULT_LEASE_TTL,
            default_retry_delays_secs: DEFAULT_RETRY_DELAYS_SECS.to_vec(),
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));

        Runner {
            store: self.store,
            queues: self.queues,
            context: self.context,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            lease_ttl: self.lease_ttl,
            default_retry_delays_secs: self.default_retry_delays_secs,
            _state: PhantomData,
        }
    }

    /// Configure the default queue
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Set how long a claimed job is leased before a crashed worker's jobs
    /// become claimable again. Heartbeats run at a third of this value.
    pub fn lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Set the retry schedule used by handlers that do not declare their own.
    pub fn default_retry_delays_secs(mut self, delays: Vec<u64>) -> Self {
        self.default_retry_delays_secs = delays;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers
    /// to shut down, or to shut them down gracefully.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for (queue_name, queue) in &self.queues {
            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    store: self.store.clone(),
                    context: self.context.clone(),
                    job_registry: Arc::new(queue.job_registry.clone()),
                    queue_name: queue_name.clone(),
                    worker_token: format!("{name}-{}", uuid::Uuid::now_v7()),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                    lease_ttl: self.lease_ttl,
                    default_retry_delays_secs: Arc::new(self.default_retry_delays_secs.clone()),
                    shutdown_rx: shutdown_rx.clone(),
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        RunHandle {
            handles,
            shutdown_tx,
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Signal the workers to stop and let in-flight jobs finish within the
    /// grace window. After that, remaining tasks are abandoned and their
    /// leases lapse, so the jobs are re-enqueued without a counted attempt.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles;
        match tokio::time::timeout(grace, join_all(handles.iter_mut())).await {
            Ok(results) => results.into_iter().for_each(|result| {
                if let Err(error) = result {
                    warn!(%error, "Background worker task panicked");
                }
            }),
            Err(_) => {
                warn!("Grace window elapsed; abandoning in-flight jobs");
                for handle in &handles {
                    handle.abort();
                }
            }
        }
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    _state: PhantomData<State>,
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context, Unconfigured> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Queue<Context, State> {
    /// Set the number of worker tasks for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Configure a job to run as part of this queue.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Queue<Context, Configured> {
        self.job_registry.register::<J>();
        Queue {
            job_registry: self.job_registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            _state: PhantomData,
        }
    }
}
