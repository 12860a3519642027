//! Background job handlers for the ingestion pipeline.

mod batch_dispatch;
mod csv_split;
mod email_poll;

pub use batch_dispatch::BatchDispatchJob;
pub use csv_split::CsvSplitJob;
pub use email_poll::EmailPollJob;

use crate::api_client::PriceApi;
use crate::object_store::ObjectStore;
use crate::storage::JobStore;
use crate::transport::EmailTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tunables shared by the pipeline handlers.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum rows per dispatched batch.
    pub batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Shared context handed to every job handler.
///
/// Handlers hold no state of their own between invocations; everything they
/// touch comes through here.
#[derive(Clone)]
pub struct AppContext {
    /// Tenant-scoped job store for spawning follow-up jobs.
    pub jobs: JobStore,
    /// Bound e-mail transport.
    pub transport: Arc<dyn EmailTransport>,
    /// Bound object store.
    pub objects: Arc<dyn ObjectStore>,
    /// Outbound price API.
    pub api: Arc<dyn PriceApi>,
    /// Pipeline tunables.
    pub settings: Arc<PipelineSettings>,
}

/// Identifies one stored attachment flowing from the poll handler to the
/// splitter and on to every batch of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    /// Id of the carrying e-mail.
    pub email_id: String,
    /// Original attachment filename.
    pub filename: String,
    /// Address of the original sender.
    pub sender: String,
    /// Subject of the carrying e-mail.
    pub subject: String,
    /// When the carrying e-mail arrived.
    pub received_at: DateTime<Utc>,
    /// Key of the uploaded attachment bytes.
    pub object_key: String,
}
