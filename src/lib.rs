#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Outbound price API client and wire types.
pub mod api_client;
mod background_job;
/// Environment-driven configuration.
pub mod config;
mod errors;
/// Typed coercion of raw CSV cells.
pub mod fields;
mod job_registry;
/// The pipeline's background job handlers.
pub mod jobs;
/// Object storage contract and bindings.
pub mod object_store;
mod runner;
/// Scheduler: promotion, recurring fires, lease recovery, retention.
pub mod scheduler;
/// Database schema definitions.
pub mod schema;
/// HTTP control surface.
pub mod server;
/// The Job Store.
pub mod storage;
/// E-mail transport contract and the mock transport.
pub mod transport;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// A named exclusion lock held while a job is processing.
pub use self::background_job::Concurrency;
/// Built-in retry schedule.
pub use self::background_job::DEFAULT_RETRY_DELAYS_SECS;
/// The default queue name.
pub use self::background_job::DEFAULT_QUEUE;
/// Queue that terminally failed jobs are routed to.
pub use self::background_job::FAILED_QUEUE;
/// Error type for job enqueueing operations.
pub use self::errors::EnqueueError;
/// Failure returned by a job handler, carrying retryability.
pub use self::errors::JobError;
/// Error type for Job Store mutations.
pub use self::errors::StoreError;
/// The main runner that orchestrates job processing.
pub use self::runner::{Queue, RunHandle, Runner};
/// Tenant-scoped handle to the job tables.
pub use self::storage::JobStore;

/// Create the job tables by running the bundled migrations.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
