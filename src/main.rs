use anyhow::Context as _;
use pricefeed::api_client::{HttpPriceApi, PriceApi};
use pricefeed::config::{Config, EmailProvider, ObjectStoreBackend};
use pricefeed::jobs::{AppContext, BatchDispatchJob, CsvSplitJob, EmailPollJob, PipelineSettings};
use pricefeed::object_store::{FsObjectStore, InMemoryObjectStore, ObjectStore};
use pricefeed::scheduler::{self, Scheduler};
use pricefeed::server::{self, ControlState};
use pricefeed::transport::{EmailTransport, MockTransport};
use pricefeed::{JobStore, Runner, setup_database};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight jobs may finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pricefeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(error) = run().await {
        tracing::error!("startup failed: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to the job store backend")?;
    setup_database(&pool)
        .await
        .context("failed to run migrations")?;

    let store = JobStore::new(pool, config.jobs.prefix.clone());

    let (transport, mock): (Arc<dyn EmailTransport>, Option<Arc<MockTransport>>) =
        match config.email.provider {
            EmailProvider::Mock => {
                let mock = Arc::new(MockTransport::new());
                (mock.clone(), Some(mock))
            }
            EmailProvider::Pop3 => anyhow::bail!(
                "the pop3 transport lives in an external adapter; \
                 deploy it or set EMAIL_PROVIDER=mock"
            ),
            EmailProvider::Imap => anyhow::bail!(
                "the imap transport lives in an external adapter; \
                 deploy it or set EMAIL_PROVIDER=mock"
            ),
        };

    let test_prefix = config.object_store.test_prefix.clone().unwrap_or_default();
    let objects: Arc<dyn ObjectStore> = match config.object_store.backend {
        ObjectStoreBackend::Memory => Arc::new(InMemoryObjectStore::with_prefix(test_prefix)),
        ObjectStoreBackend::Fs => {
            let root = config
                .object_store
                .root
                .clone()
                .context("OBJECT_STORE_ROOT is required for the fs backend")?;
            Arc::new(FsObjectStore::with_prefix(root, test_prefix))
        }
        ObjectStoreBackend::S3 => anyhow::bail!(
            "the s3 object store binding lives in an external adapter; \
             set OBJECT_STORE_BACKEND=fs or memory"
        ),
    };

    let api: Arc<dyn PriceApi> = Arc::new(
        HttpPriceApi::new(&config.api).context("failed to build the price API client")?,
    );

    let ctx = AppContext {
        jobs: store.clone(),
        transport: transport.clone(),
        objects,
        api,
        settings: Arc::new(PipelineSettings {
            batch_size: config.jobs.batch_size,
        }),
    };

    // The recurring mailbox poll, replaced cleanly on every boot.
    let next = scheduler::next_fire(&config.email_polling_cron, chrono::Utc::now())?;
    store
        .upsert_recurring("email-processing", &config.email_polling_cron, &EmailPollJob, next)
        .await
        .context("failed to register the e-mail polling schedule")?;

    let runner = Runner::new(store.clone(), ctx)
        .lease_ttl(config.jobs.lease_ttl)
        .default_retry_delays_secs(config.jobs.retry_delays_secs.clone())
        .configure_default_queue(|queue| {
            queue
                .num_workers(config.jobs.worker_count)
                .register::<EmailPollJob>()
                .register::<CsvSplitJob>()
                .register::<BatchDispatchJob>()
        });
    let run_handle = runner.start();

    let scheduler_handle = Scheduler::new(store.clone())
        .purge_after(config.jobs.purge_after)
        .start();

    let listener = tokio::net::TcpListener::bind(config.http_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_listen_addr))?;
    info!(addr = %config.http_listen_addr, "Control surface listening");

    let app = server::router(ControlState {
        jobs: store,
        transport_identity: transport.identity(),
        mock,
    });
    let http = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    scheduler_handle.shutdown().await;
    run_handle.shutdown(SHUTDOWN_GRACE).await;
    http.abort();

    Ok(())
}
