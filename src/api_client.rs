//! Outbound client for the price-list API.

use crate::config::ApiConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One CSV row after coercion: column name to typed JSON value.
pub type Row = serde_json::Map<String, Value>;

/// The JSON body POSTed for every batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    /// Original attachment filename.
    pub file_name: String,
    /// Address of the original sender.
    pub sender_email: String,
    /// Subject of the carrying e-mail.
    pub subject: String,
    /// When the carrying e-mail arrived.
    pub received_at: DateTime<Utc>,
    /// The rows of this batch.
    pub data: Vec<Row>,
    /// Whether this is the final batch of the file.
    pub is_last: bool,
}

/// The response envelope the API answers with.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    /// Whether the API accepted the batch.
    pub success: bool,
    /// Optional human-readable detail.
    #[serde(default)]
    pub message: Option<String>,
    /// Optional structured detail.
    #[serde(default)]
    pub data: Option<Value>,
}

/// Error type for API calls that never produced a usable response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Connection, timeout, or body decoding failure.
    #[error("api request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a non-success status code.
    #[error("api returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Contract of the outbound price-list API.
#[async_trait]
pub trait PriceApi: Send + Sync {
    /// POST one batch. The caller inspects [`ApiResponse::success`].
    async fn send_batch(&self, payload: &BatchPayload) -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed client with API-key and/or bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpPriceApi {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    bearer_token: Option<String>,
}

impl HttpPriceApi {
    /// Build a client from configuration, applying the configured timeout.
    pub fn new(config: &ApiConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            url: config.url(),
            api_key: config.api_key.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }
}

#[async_trait]
impl PriceApi for HttpPriceApi {
    async fn send_batch(&self, payload: &BatchPayload) -> Result<ApiResponse, ApiError> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-API-Key", api_key);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status));
        }

        Ok(response.json::<ApiResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use insta::assert_compact_json_snapshot;

    #[test]
    fn payload_serializes_in_camel_case() {
        let mut row = Row::new();
        row.insert("Product".to_string(), serde_json::json!("Widget"));
        row.insert("Price".to_string(), serde_json::json!(99.99));
        row.insert("InStock".to_string(), serde_json::json!(true));

        let payload = BatchPayload {
            file_name: "prices.csv".to_string(),
            sender_email: "supplier@example.com".to_string(),
            subject: "January prices".to_string(),
            received_at: Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap(),
            data: vec![row],
            is_last: true,
        };

        assert_compact_json_snapshot!(payload, @r#"{"fileName": "prices.csv", "senderEmail": "supplier@example.com", "subject": "January prices", "receivedAt": "2024-01-15T09:30:00Z", "data": [{"Product": "Widget", "Price": 99.99, "InStock": true}], "isLast": true}"#);
    }

    #[test]
    fn response_envelope_tolerates_missing_fields() {
        let response: ApiResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(response.success);
        assert_eq!(response.message, None);
        assert_eq!(response.data, None);

        let response: ApiResponse =
            serde_json::from_str(r#"{"success": false, "message": "bad batch"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("bad batch"));
    }
}
