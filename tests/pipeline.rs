#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use pricefeed::api_client::HttpPriceApi;
use pricefeed::config::ApiConfig;
use pricefeed::jobs::{AppContext, BatchDispatchJob, CsvSplitJob, EmailPollJob, PipelineSettings};
use pricefeed::object_store::InMemoryObjectStore;
use pricefeed::scheduler::Scheduler;
use pricefeed::server::{self, ControlState};
use pricefeed::transport::MockTransport;
use pricefeed::{JobStore, Runner, setup_database};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }
}

#[derive(Debug, Default)]
struct FakeApiInner {
    posts: Vec<Value>,
    accepted: HashMap<String, usize>,
}

/// In-process stand-in for the external price API. Records every POST and
/// can be told to reject the nth batch of every file.
#[derive(Clone)]
struct FakeApiState {
    inner: Arc<Mutex<FakeApiInner>>,
    fail_batch: Option<usize>,
}

async fn fake_api_handler(
    State(state): State<FakeApiState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut inner = state.inner.lock().unwrap();
    let file = body["fileName"].as_str().unwrap_or_default().to_string();
    let batch_number = inner.accepted.get(&file).copied().unwrap_or(0) + 1;
    inner.posts.push(body);

    if state.fail_batch == Some(batch_number) {
        return Json(json!({ "success": false, "message": "batch rejected" }));
    }

    *inner.accepted.entry(file).or_insert(0) += 1;
    Json(json!({ "success": true, "message": "ok", "data": null }))
}

struct TestApp {
    store: JobStore,
    mock: Arc<MockTransport>,
    api_inner: Arc<Mutex<FakeApiInner>>,
    control_addr: SocketAddr,
    client: reqwest::Client,
    run_handle: pricefeed::RunHandle,
    scheduler_handle: pricefeed::scheduler::SchedulerHandle,
}

impl TestApp {
    async fn spawn(
        pool: PgPool,
        fail_batch: Option<usize>,
        batch_size: usize,
    ) -> anyhow::Result<TestApp> {
        let tenant = format!("test-{}", uuid::Uuid::new_v4());
        let store = JobStore::new(pool, tenant.clone());

        // Fake price API on an ephemeral port.
        let api_inner = Arc::new(Mutex::new(FakeApiInner::default()));
        let api_router = Router::new()
            .route("/api/price-lists", post(fake_api_handler))
            .with_state(FakeApiState {
                inner: api_inner.clone(),
                fail_batch,
            });
        let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let api_addr = api_listener.local_addr()?;
        tokio::spawn(async move { axum::serve(api_listener, api_router).await });

        let api = HttpPriceApi::new(&ApiConfig {
            base_url: format!("http://{api_addr}"),
            endpoint: "/api/price-lists".to_string(),
            api_key: Some("test-key".to_string()),
            bearer_token: None,
            timeout: Duration::from_secs(5),
        })?;

        let mock = Arc::new(MockTransport::new());
        let ctx = AppContext {
            jobs: store.clone(),
            transport: mock.clone(),
            objects: Arc::new(InMemoryObjectStore::with_prefix(format!("{tenant}/"))),
            api: Arc::new(api),
            settings: Arc::new(PipelineSettings { batch_size }),
        };

        let runner = Runner::new(store.clone(), ctx)
            .lease_ttl(Duration::from_secs(30))
            .default_retry_delays_secs(vec![0, 0, 0])
            .configure_default_queue(|queue| {
                queue
                    .num_workers(2)
                    .poll_interval(Duration::from_millis(50))
                    .jitter(Duration::from_millis(10))
                    .register::<EmailPollJob>()
                    .register::<CsvSplitJob>()
                    .register::<BatchDispatchJob>()
            });
        let run_handle = runner.start();

        let scheduler_handle = Scheduler::new(store.clone())
            .tick_interval(Duration::from_millis(50))
            .start();

        // Control surface on an ephemeral port.
        let control_router = server::router(ControlState {
            jobs: store.clone(),
            transport_identity: "mock",
            mock: Some(mock.clone()),
        });
        let control_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let control_addr = control_listener.local_addr()?;
        tokio::spawn(async move { axum::serve(control_listener, control_router).await });

        Ok(TestApp {
            store,
            mock,
            api_inner,
            control_addr,
            client: reqwest::Client::new(),
            run_handle,
            scheduler_handle,
        })
    }

    fn control_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.control_addr)
    }

    async fn seed_email(&self, id: &str, attachments: &[(&str, &str)]) -> anyhow::Result<()> {
        let body = json!({
            "id": id,
            "from": "supplier@example.com",
            "subject": "January prices",
            "attachments": attachments
                .iter()
                .map(|(filename, content)| json!({ "filename": filename, "content": content }))
                .collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(self.control_url("/test/emails"))
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(response.status().as_u16() == 201, "seeding failed");
        Ok(())
    }

    async fn trigger_poll(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.control_url("/jobs/email-poll"))
            .send()
            .await?;
        anyhow::ensure!(response.status().as_u16() == 202, "trigger failed");
        Ok(())
    }

    fn posts(&self) -> Vec<Value> {
        self.api_inner.lock().unwrap().posts.clone()
    }

    async fn shutdown(self) {
        self.scheduler_handle.shutdown().await;
        self.run_handle.shutdown(Duration::from_secs(1)).await;
    }
}

fn price_csv(rows: usize) -> String {
    let mut csv = String::from("Product,SKU,Price,Category\n");
    for i in 0..rows {
        csv.push_str(&format!("Product {i},SKU-{i},99.99,Tools\n"));
    }
    csv
}

async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

const WAIT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn small_file_is_delivered_and_replied() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let app = TestApp::spawn(pool, None, 1000).await?;

    // Liveness and transport identity, straight off the control surface.
    let health = app.client.get(app.control_url("/healthz")).send().await?;
    assert_eq!(health.status().as_u16(), 200);
    let transport: Value = app
        .client
        .get(app.control_url("/transport"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(transport["provider"], json!("mock"));

    app.seed_email("m-1", &[("prices.csv", &price_csv(3))]).await?;
    app.trigger_poll().await?;

    assert!(wait_for(WAIT, || async { app.posts().len() == 1 }).await);

    let posts = app.posts();
    let post = &posts[0];
    assert_eq!(post["fileName"], json!("prices.csv"));
    assert_eq!(post["senderEmail"], json!("supplier@example.com"));
    assert_eq!(post["subject"], json!("January prices"));
    assert_eq!(post["isLast"], json!(true));

    let data = post["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0]["Product"], json!("Product 0"));
    assert_eq!(data[0]["Price"], json!(99.99));

    assert!(wait_for(WAIT, || async { app.mock.replies().len() == 1 }).await);
    let replies = app.mock.replies();
    let reply = &replies[0];
    assert_eq!(reply.message_id, "m-1");
    assert!(reply.body.contains("prices.csv"));
    assert!(reply.body.contains("Batches delivered: 1"));
    assert!(app.mock.is_processed("m-1"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn large_file_splits_into_ordered_batches() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let app = TestApp::spawn(pool, None, 1000).await?;

    app.seed_email("m-1", &[("big.csv", &price_csv(2500))]).await?;
    app.trigger_poll().await?;

    assert!(wait_for(WAIT, || async { app.posts().len() == 3 }).await);

    let posts = app.posts();
    let sizes: Vec<usize> = posts
        .iter()
        .map(|post| post["data"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);

    let last_flags: Vec<bool> = posts
        .iter()
        .map(|post| post["isLast"].as_bool().unwrap())
        .collect();
    assert_eq!(last_flags, vec![false, false, true]);

    assert!(wait_for(WAIT, || async { app.mock.replies().len() == 1 }).await);
    assert!(app.mock.replies()[0].body.contains("Batches delivered: 3"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn each_attachment_gets_its_own_chain_and_reply() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let app = TestApp::spawn(pool, None, 1000).await?;

    app.seed_email(
        "m-1",
        &[("first.csv", &price_csv(3)), ("second.csv", &price_csv(3))],
    )
    .await?;
    app.trigger_poll().await?;

    assert!(wait_for(WAIT, || async { app.posts().len() == 2 }).await);

    let posts = app.posts();
    let mut files: Vec<&str> = posts
        .iter()
        .map(|post| post["fileName"].as_str().unwrap())
        .collect();
    files.sort_unstable();
    assert_eq!(files, vec!["first.csv", "second.csv"]);
    assert!(posts.iter().all(|post| post["isLast"] == json!(true)));

    // One reply per attachment, both to the same original message.
    assert!(wait_for(WAIT, || async { app.mock.replies().len() == 2 }).await);
    assert!(
        app.mock
            .replies()
            .iter()
            .all(|reply| reply.message_id == "m-1")
    );

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_files_produce_no_batches_and_no_reply() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let app = TestApp::spawn(pool, None, 1000).await?;

    app.seed_email("m-1", &[("empty.csv", &price_csv(0))]).await?;
    app.trigger_poll().await?;

    assert!(wait_for(WAIT, || async { app.mock.is_processed("m-1") }).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(app.posts().is_empty());
    assert!(app.mock.replies().is_empty());

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_files_fail_without_retries() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let app = TestApp::spawn(pool, None, 1000).await?;

    app.seed_email("m-1", &[("broken.csv", "")]).await?;
    app.trigger_poll().await?;

    let store = app.store.clone();
    assert!(
        wait_for(WAIT, || {
            let store = store.clone();
            async move { store.failed_job_count().await.unwrap_or(0) == 1 }
        })
        .await
    );

    let failed = app.store.jobs_in_queue("failed").await?;
    assert_eq!(failed.len(), 1);
    // Validation failures are not worth retrying: one attempt, straight to failed.
    assert_eq!(failed[0].attempts, 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("header"));

    assert!(app.posts().is_empty());
    assert!(app.mock.replies().is_empty());
    assert!(app.mock.is_processed("m-1"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_rejected_batch_blocks_the_rest_of_its_chain() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    // 5 rows at batch size 2 -> batches of 2, 2, 1. The API rejects every
    // attempt at batch 2.
    let app = TestApp::spawn(pool, Some(2), 2).await?;

    app.seed_email("m-1", &[("prices.csv", &price_csv(5))]).await?;
    app.trigger_poll().await?;

    // Batch 2 exhausts its retries, and batch 3 is failed with it.
    let store = app.store.clone();
    assert!(
        wait_for(WAIT, || {
            let store = store.clone();
            async move { store.failed_job_count().await.unwrap_or(0) == 2 }
        })
        .await
    );

    let posts = app.posts();
    // Batch 1 accepted once, batch 2 attempted 1 + 3 retries; batch 3 never
    // reached the API.
    assert_eq!(posts.len(), 5);
    assert!(
        posts
            .iter()
            .all(|post| post["data"].as_array().unwrap().len() == 2)
    );

    let failed = app.store.jobs_in_queue("failed").await?;
    assert_eq!(failed.len(), 2);

    let exhausted = failed
        .iter()
        .find(|job| job.data["batch_number"] == json!(2))
        .unwrap();
    assert_eq!(exhausted.attempts, 4);

    let never_ran = failed
        .iter()
        .find(|job| job.data["batch_number"] == json!(3))
        .unwrap();
    assert_eq!(never_ran.attempts, 0);
    assert_eq!(never_ran.last_error.as_deref(), Some("parent job failed"));

    // No final batch succeeded, so the sender never got a receipt.
    assert!(app.mock.replies().is_empty());

    app.shutdown().await;
    Ok(())
}
