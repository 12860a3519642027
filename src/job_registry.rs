use crate::background_job::BackgroundJob;
use crate::errors::JobError;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Dispatch entry for one registered job type.
pub(crate) struct RegisteredJob<Context> {
    pub(crate) run: RunTaskFn<Context>,
    pub(crate) retry_delays_secs: Option<&'static [u64]>,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            retry_delays_secs: self.retry_delays_secs,
        }
    }
}

/// Maps job type names to their type-erased run functions.
pub(crate) struct JobRegistry<Context> {
    jobs: HashMap<String, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.jobs.insert(
            J::JOB_NAME.to_string(),
            RegisteredJob {
                run: Arc::new(runnable::<J>),
                retry_delays_secs: J::RETRY_DELAYS_SECS,
            },
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.jobs.get(job_type)
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    payload: Value,
) -> BoxFuture<'static, Result<(), JobError>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(payload).map_err(|err| {
            JobError::fatal(anyhow::anyhow!(
                "invalid payload for job `{}`: {err}",
                J::JOB_NAME
            ))
        })?;
        job.run(ctx).await
    })
}
