//! The scheduler: a single logical clock over the Job Store.
//!
//! Any instance may run it; a store-level lock picks one winner per tick.
//! Each tick recovers lapsed leases, promotes due scheduled jobs, fires due
//! recurring schedules, and periodically applies the retention policy.

use crate::errors::StoreError;
use crate::storage::JobStore;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const SCHEDULER_LOCK_KEY: &str = "scheduler";
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PURGE_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Ticks between retention sweeps.
const PURGE_EVERY_TICKS: u64 = 60;

/// The next instant `cron_expr` matches strictly after `after`.
///
/// Accepts standard 5-field expressions as well as 6-field ones with a
/// leading seconds field.
pub fn next_fire(cron_expr: &str, after: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let normalized = normalize_cron(cron_expr);
    let schedule = Schedule::from_str(&normalized)
        .map_err(|err| anyhow::anyhow!("invalid cron expression `{cron_expr}`: {err}"))?;

    schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression `{cron_expr}` never fires"))
}

// The cron crate wants a seconds field; standard 5-field expressions get one
// prepended.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Drives promotion, recurring fires, lease recovery, and retention.
#[derive(Debug)]
pub struct Scheduler {
    store: JobStore,
    tick_interval: Duration,
    purge_after: Duration,
    instance_token: String,
}

impl Scheduler {
    /// Create a scheduler over the given store with default timing.
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            tick_interval: DEFAULT_TICK_INTERVAL,
            purge_after: DEFAULT_PURGE_AFTER,
            instance_token: format!("scheduler-{}", uuid::Uuid::now_v7()),
        }
    }

    /// Set the tick interval (at most one second in production).
    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Set how long terminal jobs are retained before being purged.
    pub fn purge_after(mut self, purge_after: Duration) -> Self {
        self.purge_after = purge_after;
        self
    }

    /// Spawn the tick loop.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tick_count: u64 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                tick_count += 1;
                if let Err(error) = self.tick(tick_count).await {
                    error!(%error, "Scheduler tick failed");
                }
            }

            debug!("Scheduler stopped");
        });

        SchedulerHandle {
            handle,
            shutdown_tx,
        }
    }

    async fn tick(&self, tick_count: u64) -> Result<(), StoreError> {
        // Any instance may run the clock; the named lock picks one per tick.
        let lock_ttl = (self.tick_interval * 2).max(Duration::from_secs(2));
        if !self
            .store
            .try_acquire_lock(SCHEDULER_LOCK_KEY, &self.instance_token, lock_ttl)
            .await?
        {
            return Ok(());
        }

        let released = self.store.release_expired_leases().await?;
        if released > 0 {
            info!(released, "Re-enqueued jobs from lapsed leases");
        }

        let promoted = self.store.promote_scheduled().await?;
        if promoted > 0 {
            debug!(promoted, "Promoted scheduled jobs");
        }

        self.fire_due_schedules().await?;

        if tick_count % PURGE_EVERY_TICKS == 0 {
            let purged = self.store.purge_terminal(self.purge_after).await?;
            if purged > 0 {
                info!(purged, "Purged terminal jobs past retention");
            }
        }

        Ok(())
    }

    async fn fire_due_schedules(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        for schedule in self.store.due_recurring(now).await? {
            let next = match next_fire(&schedule.cron_expr, now) {
                Ok(next) => next,
                Err(error) => {
                    // A broken expression must not take the scheduler down.
                    error!(schedule = %schedule.name, %error, "Skipping recurring schedule");
                    continue;
                }
            };

            let claimed = self
                .store
                .claim_recurring_fire(&schedule.name, schedule.next_fire_at, next, now)
                .await?;
            if !claimed {
                continue;
            }

            match self.store.enqueue(schedule.to_new_job()).await {
                Ok(id) => {
                    info!(schedule = %schedule.name, job.id = id, "Fired recurring schedule");
                }
                Err(error) => {
                    error!(schedule = %schedule.name, %error, "Failed to enqueue recurring job");
                }
            }
        }

        Ok(())
    }
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Stop the tick loop and wait briefly for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let mut handle = self.handle;
        if tokio::time::timeout(Duration::from_secs(5), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn next_fire_lands_on_the_next_five_minute_mark() {
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 10, 2, 30).unwrap();
        let next = next_fire("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 10, 5, 0).unwrap());
    }

    #[test]
    fn seconds_granularity_is_accepted() {
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let next = next_fire("30 * * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 30).unwrap());
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!(next_fire("not a cron", Utc::now()).is_err());
    }
}
