//! HTTP control surface.
//!
//! The minimum surface the deployment and the test harness need: a liveness
//! probe, the identity of the bound transport, seeding test e-mails into the
//! mock transport, and triggering an immediate mailbox poll.

use crate::BackgroundJob;
use crate::jobs::EmailPollJob;
use crate::storage::JobStore;
use crate::transport::{EmailAttachment, EmailMessage, MockTransport};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

/// Shared state of the control surface.
#[derive(Clone)]
pub struct ControlState {
    /// Store used to enqueue triggered jobs.
    pub jobs: JobStore,
    /// Identity of the bound transport.
    pub transport_identity: &'static str,
    /// Present only when the bound transport is the mock.
    pub mock: Option<Arc<MockTransport>>,
}

/// Build the control-surface router.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/transport", get(transport_identity))
        .route("/test/emails", post(seed_email))
        .route("/jobs/email-poll", post(trigger_poll))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn transport_identity(State(state): State<ControlState>) -> impl IntoResponse {
    Json(serde_json::json!({ "provider": state.transport_identity }))
}

#[derive(Debug, Deserialize)]
struct SeedEmailRequest {
    id: Option<String>,
    from: String,
    subject: String,
    #[serde(default)]
    attachments: Vec<SeedAttachment>,
}

#[derive(Debug, Deserialize)]
struct SeedAttachment {
    filename: String,
    #[serde(default = "default_content_type")]
    content_type: String,
    content: String,
}

fn default_content_type() -> String {
    "text/csv".to_string()
}

async fn seed_email(
    State(state): State<ControlState>,
    Json(request): Json<SeedEmailRequest>,
) -> Response {
    let Some(mock) = &state.mock else {
        return json_error(
            StatusCode::CONFLICT,
            "not_mock",
            "the bound transport is not the mock transport",
        );
    };

    let id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    mock.seed(EmailMessage {
        id: id.clone(),
        from: request.from,
        subject: request.subject,
        received_at: Utc::now(),
        attachments: request
            .attachments
            .into_iter()
            .map(|attachment| EmailAttachment {
                filename: attachment.filename,
                content_type: attachment.content_type,
                bytes: attachment.content.into_bytes(),
            })
            .collect(),
    });

    (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
}

async fn trigger_poll(State(state): State<ControlState>) -> Response {
    match EmailPollJob.enqueue(&state.jobs).await {
        Ok(Some(id)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "jobId": id })),
        )
            .into_response(),
        // An identical poll is already waiting; nothing new to enqueue.
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "jobId": null, "deduplicated": true })),
        )
            .into_response(),
        Err(error) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "enqueue_failed",
            error.to_string(),
        ),
    }
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
