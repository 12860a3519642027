//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the background
//! job system.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;

/// Execution state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Ready to be claimed by a worker.
    Enqueued,
    /// Waiting for `next_attempt_at` before becoming ready.
    Scheduled,
    /// Claimed by a worker holding a live lease.
    Processing,
    /// Finished successfully; kept until purged.
    Succeeded,
    /// Retries exhausted (or failure was fatal); routed to the failed queue.
    Failed,
    /// Gated on a parent job reaching [`JobState::Succeeded`].
    AwaitingParent,
}

impl JobState {
    /// Database representation of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Scheduled => "scheduled",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::AwaitingParent => "awaiting_parent",
        }
    }

    /// Parse the database representation back into a state.
    pub fn parse(value: &str) -> Option<JobState> {
        Some(match value {
            "enqueued" => JobState::Enqueued,
            "scheduled" => JobState::Scheduled,
            "processing" => JobState::Processing,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "awaiting_parent" => JobState::AwaitingParent,
            _ => return None,
        })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a job record in the `background_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique, monotonically increasing identifier.
    pub id: i64,
    /// Deployment prefix the record belongs to.
    pub tenant: String,
    /// Logical lane the job waits in.
    pub queue: String,
    /// Type identifier used for handler dispatch.
    pub job_type: String,
    /// JSON payload with the handler arguments.
    pub data: Value,
    /// Database representation of the state; see [`JobRecord::state`].
    pub state: String,
    /// Fetch priority (higher = sooner).
    pub priority: i16,
    /// Number of failed attempts so far.
    pub attempts: i32,
    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
    /// When the job last became ready.
    pub enqueued_at: Option<DateTime<Utc>>,
    /// When the current (or last) attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest instant a scheduled job becomes ready again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Job that must succeed before this one may run.
    pub parent_id: Option<i64>,
    /// Named exclusion lock the job must hold while processing.
    pub concurrency_key: Option<String>,
    /// Exclusion window of the lock, in seconds.
    pub concurrency_ttl_secs: Option<i64>,
    /// Lease token of the worker currently processing the job.
    pub owner_token: Option<String>,
    /// When the current lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

impl JobRecord {
    /// The typed state, or `None` for an unknown database value.
    pub fn state(&self) -> Option<JobState> {
        JobState::parse(&self.state)
    }
}

/// A job to be inserted into the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Queue the job belongs to.
    pub queue: String,
    /// Type identifier used for handler dispatch.
    pub job_type: String,
    /// JSON payload with the handler arguments.
    pub data: Value,
    /// Fetch priority (higher = sooner).
    pub priority: i16,
    /// Named exclusion lock, if any.
    pub concurrency_key: Option<String>,
    /// Exclusion window of the lock, in seconds.
    pub concurrency_ttl_secs: Option<i64>,
}

/// Represents a recurring schedule in the `recurring_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct RecurringRecord {
    /// Deployment prefix the schedule belongs to.
    pub tenant: String,
    /// Unique schedule name within the tenant.
    pub name: String,
    /// Cron expression (5- or 6-field) driving the schedule.
    pub cron_expr: String,
    /// Queue fired jobs are appended to.
    pub queue: String,
    /// Type identifier of the fired job.
    pub job_type: String,
    /// Payload of the fired job.
    pub data: Value,
    /// Priority of the fired job.
    pub priority: i16,
    /// Exclusion lock of the fired job, if any.
    pub concurrency_key: Option<String>,
    /// Exclusion window of the lock, in seconds.
    pub concurrency_ttl_secs: Option<i64>,
    /// Last instant the schedule fired.
    pub last_fire_at: Option<DateTime<Utc>>,
    /// Next instant the schedule is due.
    pub next_fire_at: DateTime<Utc>,
}

impl RecurringRecord {
    /// The job this schedule enqueues on every fire.
    pub fn to_new_job(&self) -> NewJob {
        NewJob {
            queue: self.queue.clone(),
            job_type: self.job_type.clone(),
            data: self.data.clone(),
            priority: self.priority,
            concurrency_key: self.concurrency_key.clone(),
            concurrency_ttl_secs: self.concurrency_ttl_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_its_database_form() {
        for state in [
            JobState::Enqueued,
            JobState::Scheduled,
            JobState::Processing,
            JobState::Succeeded,
            JobState::Failed,
            JobState::AwaitingParent,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }
}
