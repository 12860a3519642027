use crate::background_job::BackgroundJob;
use crate::errors::{EnqueueError, StoreError};
use crate::schema::{JobRecord, NewJob, RecurringRecord};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

/// Tenant-scoped handle to the job tables.
///
/// Every query is filtered by the deployment prefix handed to [`JobStore::new`],
/// so several deployments and test runs can share one database without
/// touching each other's jobs.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
    tenant: String,
}

impl JobStore {
    /// Create a store over the given pool, namespaced by `tenant`.
    pub fn new(pool: PgPool, tenant: impl Into<String>) -> Self {
        Self {
            pool,
            tenant: tenant.into(),
        }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The deployment prefix this store is namespaced by.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Insert a job in the `enqueued` state and return its id.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, EnqueueError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (tenant, queue, job_type, data, state, priority,
                 concurrency_key, concurrency_ttl_secs, enqueued_at)
            VALUES ($1, $2, $3, $4, 'enqueued', $5, $6, $7, NOW())
            RETURNING id
            ",
        )
        .bind(&self.tenant)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.priority)
        .bind(&job.concurrency_key)
        .bind(job.concurrency_ttl_secs)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Insert a job only if no identical unstarted job already exists.
    ///
    /// Returns `None` when the job was deduplicated.
    pub async fn enqueue_deduplicated(&self, job: NewJob) -> Result<Option<i64>, EnqueueError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (tenant, queue, job_type, data, state, priority,
                 concurrency_key, concurrency_ttl_secs, enqueued_at)
            SELECT $1, $2, $3, $4, 'enqueued', $5, $6, $7, NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM background_jobs
                WHERE tenant = $1 AND job_type = $3 AND data = $4
                  AND priority = $5 AND state = 'enqueued'
            )
            RETURNING id
            ",
        )
        .bind(&self.tenant)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.priority)
        .bind(&job.concurrency_key)
        .bind(job.concurrency_ttl_secs)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// Insert a job in the `scheduled` state, becoming ready at `at`.
    pub async fn schedule(&self, job: NewJob, at: DateTime<Utc>) -> Result<i64, EnqueueError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (tenant, queue, job_type, data, state, priority,
                 concurrency_key, concurrency_ttl_secs, next_attempt_at)
            VALUES ($1, $2, $3, $4, 'scheduled', $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&self.tenant)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.priority)
        .bind(&job.concurrency_key)
        .bind(job.concurrency_ttl_secs)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Insert a job gated on `parent_id` reaching success.
    ///
    /// The parent row is locked while deciding the initial state, so the
    /// insert cannot race the parent's completion: a parent that already
    /// succeeded yields an immediately runnable job, a parent that already
    /// failed terminally sends the child straight to the failed queue, and
    /// anything else waits for the promotion that runs inside
    /// [`JobStore::complete_job`].
    pub async fn enqueue_continuation(
        &self,
        parent_id: i64,
        job: NewJob,
    ) -> Result<i64, EnqueueError> {
        let mut tx = self.pool.begin().await?;

        let parent_state: Option<String> = sqlx::query_scalar(
            "SELECT state FROM background_jobs WHERE tenant = $1 AND id = $2 FOR UPDATE",
        )
        .bind(&self.tenant)
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?;

        // A missing parent can only mean it succeeded long enough ago to be
        // purged; the chain is still intact.
        let state = match parent_state.as_deref() {
            Some("succeeded") | None => "enqueued",
            Some("failed") => "failed",
            Some(_) => "awaiting_parent",
        };
        let queue = if state == "failed" { "failed" } else { job.queue.as_str() };

        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (tenant, queue, job_type, data, state, priority, parent_id,
                 concurrency_key, concurrency_ttl_secs, enqueued_at, finished_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $5 = 'enqueued' THEN NOW() END,
                    CASE WHEN $5 = 'failed' THEN NOW() END,
                    CASE WHEN $5 = 'failed' THEN 'parent job failed' END)
            RETURNING id
            ",
        )
        .bind(&self.tenant)
        .bind(queue)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(state)
        .bind(job.priority)
        .bind(parent_id)
        .bind(&job.concurrency_key)
        .bind(job.concurrency_ttl_secs)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Atomically claim the next ready job from `queues`.
    ///
    /// The claimed job moves to `processing` with `owner` as its lease token
    /// and a lease that lapses after `lease_ttl` unless extended.
    pub async fn fetch_ready_job(
        &self,
        queues: &[String],
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let job = sqlx::query_as::<_, JobRecord>(
            r"
            UPDATE background_jobs
            SET state = 'processing', owner_token = $3, started_at = NOW(),
                lease_expires_at = NOW() + make_interval(secs => $4)
            WHERE id = (
                SELECT id FROM background_jobs
                WHERE tenant = $1 AND queue = ANY($2) AND state = 'enqueued'
                ORDER BY priority DESC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(&self.tenant)
        .bind(queues)
        .bind(owner)
        .bind(lease_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Mark a processing job as succeeded and release any continuations
    /// gated on it. Guarded by the lease token.
    pub async fn complete_job(&self, id: i64, owner: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'succeeded', finished_at = NOW(),
                owner_token = NULL, lease_expires_at = NULL
            WHERE tenant = $1 AND id = $2 AND owner_token = $3 AND state = 'processing'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .bind(owner)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(self.missing_or_lease_lost(id, owner).await);
        }

        sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'enqueued', enqueued_at = NOW()
            WHERE tenant = $1 AND parent_id = $2 AND state = 'awaiting_parent'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record a failed attempt. Guarded by the lease token.
    ///
    /// With `retry_at` the job returns to `scheduled` for another attempt;
    /// without it the job moves to the `failed` queue and every descendant
    /// still awaiting it is failed as well.
    pub async fn fail_job(
        &self,
        id: i64,
        owner: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let Some(retry_at) = retry_at else {
            return self.fail_job_terminally(id, owner, error).await;
        };

        let updated = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'scheduled', next_attempt_at = $4, attempts = attempts + 1,
                last_error = $5, owner_token = NULL, lease_expires_at = NULL
            WHERE tenant = $1 AND id = $2 AND owner_token = $3 AND state = 'processing'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .bind(owner)
        .bind(retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.missing_or_lease_lost(id, owner).await);
        }
        Ok(())
    }

    async fn fail_job_terminally(
        &self,
        id: i64,
        owner: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'failed', queue = 'failed', attempts = attempts + 1,
                finished_at = NOW(), last_error = $4,
                owner_token = NULL, lease_expires_at = NULL
            WHERE tenant = $1 AND id = $2 AND owner_token = $3 AND state = 'processing'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .bind(owner)
        .bind(error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(self.missing_or_lease_lost(id, owner).await);
        }

        // The whole continuation chain below a dead parent can never run.
        sqlx::query(
            r"
            WITH RECURSIVE descendants AS (
                SELECT id FROM background_jobs
                WHERE tenant = $1 AND parent_id = $2 AND state = 'awaiting_parent'
                UNION ALL
                SELECT j.id FROM background_jobs j
                JOIN descendants d ON j.parent_id = d.id
                WHERE j.tenant = $1 AND j.state = 'awaiting_parent'
            )
            UPDATE background_jobs
            SET state = 'failed', queue = 'failed', finished_at = NOW(),
                last_error = 'parent job failed'
            WHERE id IN (SELECT id FROM descendants)
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return a claimed job to the queue without counting an attempt,
    /// becoming ready again at `until`. Used when a job's concurrency lock
    /// is held elsewhere. Guarded by the lease token.
    pub async fn defer_job(
        &self,
        id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'scheduled', next_attempt_at = $4,
                owner_token = NULL, lease_expires_at = NULL
            WHERE tenant = $1 AND id = $2 AND owner_token = $3 AND state = 'processing'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .bind(owner)
        .bind(until)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.missing_or_lease_lost(id, owner).await);
        }
        Ok(())
    }

    /// Extend the lease on a processing job. Returns `false` if the lease
    /// is no longer held by `owner`.
    pub async fn extend_lease(
        &self,
        id: i64,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r"
            UPDATE background_jobs
            SET lease_expires_at = NOW() + make_interval(secs => $4)
            WHERE tenant = $1 AND id = $2 AND owner_token = $3 AND state = 'processing'
            ",
        )
        .bind(&self.tenant)
        .bind(id)
        .bind(owner)
        .bind(lease_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// Re-enqueue processing jobs whose lease has lapsed (crashed workers).
    ///
    /// The interrupted attempt is not counted against the job.
    pub async fn release_expired_leases(&self) -> Result<u64, StoreError> {
        let released = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'enqueued', enqueued_at = NOW(),
                owner_token = NULL, lease_expires_at = NULL
            WHERE tenant = $1 AND state = 'processing' AND lease_expires_at < NOW()
            ",
        )
        .bind(&self.tenant)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(released)
    }

    /// Promote scheduled jobs whose time has come back into their queue.
    pub async fn promote_scheduled(&self) -> Result<u64, StoreError> {
        let promoted = sqlx::query(
            r"
            UPDATE background_jobs
            SET state = 'enqueued', enqueued_at = NOW(), next_attempt_at = NULL
            WHERE tenant = $1 AND state = 'scheduled' AND next_attempt_at <= NOW()
            ",
        )
        .bind(&self.tenant)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(promoted)
    }

    /// Remove terminal jobs older than the retention window, along with any
    /// expired concurrency locks. Returns the number of jobs removed.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<u64, StoreError> {
        let purged = sqlx::query(
            r"
            DELETE FROM background_jobs
            WHERE tenant = $1 AND state IN ('succeeded', 'failed')
              AND finished_at < NOW() - make_interval(secs => $2)
            ",
        )
        .bind(&self.tenant)
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM concurrency_locks WHERE tenant = $1 AND expires_at < NOW()")
            .bind(&self.tenant)
            .execute(&self.pool)
            .await?;

        Ok(purged)
    }

    /// Try to take the named lock for `ttl`. Succeeds when the lock is free,
    /// expired, or already held by `owner`.
    pub async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let acquired = sqlx::query(
            r"
            INSERT INTO concurrency_locks (tenant, key, owner_token, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (tenant, key) DO UPDATE
            SET owner_token = EXCLUDED.owner_token, expires_at = EXCLUDED.expires_at
            WHERE concurrency_locks.expires_at < NOW()
               OR concurrency_locks.owner_token = EXCLUDED.owner_token
            ",
        )
        .bind(&self.tenant)
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(acquired == 1)
    }

    /// Release the named lock if still held by `owner`.
    pub async fn release_lock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM concurrency_locks WHERE tenant = $1 AND key = $2 AND owner_token = $3")
            .bind(&self.tenant)
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Create or cleanly replace a recurring schedule.
    pub async fn upsert_recurring<J: BackgroundJob>(
        &self,
        name: &str,
        cron_expr: &str,
        job: &J,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), EnqueueError> {
        let new_job = job.to_new_job()?;

        sqlx::query(
            r"
            INSERT INTO recurring_jobs
                (tenant, name, cron_expr, queue, job_type, data, priority,
                 concurrency_key, concurrency_ttl_secs, next_fire_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant, name) DO UPDATE
            SET cron_expr = EXCLUDED.cron_expr, queue = EXCLUDED.queue,
                job_type = EXCLUDED.job_type, data = EXCLUDED.data,
                priority = EXCLUDED.priority,
                concurrency_key = EXCLUDED.concurrency_key,
                concurrency_ttl_secs = EXCLUDED.concurrency_ttl_secs,
                next_fire_at = EXCLUDED.next_fire_at
            ",
        )
        .bind(&self.tenant)
        .bind(name)
        .bind(cron_expr)
        .bind(&new_job.queue)
        .bind(&new_job.job_type)
        .bind(&new_job.data)
        .bind(new_job.priority)
        .bind(&new_job.concurrency_key)
        .bind(new_job.concurrency_ttl_secs)
        .bind(next_fire_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recurring schedules due at `now`, ordered by name.
    pub async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringRecord>, StoreError> {
        let due = sqlx::query_as::<_, RecurringRecord>(
            "SELECT * FROM recurring_jobs WHERE tenant = $1 AND next_fire_at <= $2 ORDER BY name",
        )
        .bind(&self.tenant)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(due)
    }

    /// Claim one fire of a recurring schedule with a compare-and-set on the
    /// observed `next_fire_at`. Exactly one caller wins per due instant, so
    /// multiple scheduler instances never double-fire.
    pub async fn claim_recurring_fire(
        &self,
        name: &str,
        observed_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claimed = sqlx::query(
            r"
            UPDATE recurring_jobs
            SET last_fire_at = $3, next_fire_at = $4
            WHERE tenant = $1 AND name = $2 AND next_fire_at = $5
            ",
        )
        .bind(&self.tenant)
        .bind(name)
        .bind(fired_at)
        .bind(new_next)
        .bind(observed_next)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(claimed == 1)
    }

    /// Look up a single job record.
    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        let job = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM background_jobs WHERE tenant = $1 AND id = $2",
        )
        .bind(&self.tenant)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// All jobs currently in the given queue, oldest first.
    pub async fn jobs_in_queue(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM background_jobs WHERE tenant = $1 AND queue = $2 ORDER BY id",
        )
        .bind(&self.tenant)
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// The number of jobs that have failed terminally.
    pub async fn failed_job_count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM background_jobs WHERE tenant = $1 AND state = 'failed'",
        )
        .bind(&self.tenant)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn missing_or_lease_lost(&self, job_id: i64, owner: &str) -> StoreError {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM background_jobs WHERE tenant = $1 AND id = $2",
        )
        .bind(&self.tenant)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await;

        match exists {
            Ok(Some(_)) => StoreError::LeaseLost {
                job_id,
                owner: owner.to_string(),
            },
            Ok(None) => StoreError::JobNotFound(job_id),
            Err(err) => StoreError::Database(err),
        }
    }
}
