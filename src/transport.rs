//! E-mail transport contract and the in-memory mock transport.
//!
//! The network transports (POP3, IMAP, their SMTP reply sibling) live in
//! external adapters; this module defines the contract they implement and
//! ships the mock transport the test harness drives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

/// One attachment of an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    /// Original filename as sent.
    pub filename: String,
    /// Declared MIME type.
    pub content_type: String,
    /// Raw attachment bytes.
    pub bytes: Vec<u8>,
}

impl EmailAttachment {
    /// Attachment size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the attachment is a CSV by filename, case-insensitively.
    pub fn is_csv(&self) -> bool {
        self.filename.to_ascii_lowercase().ends_with(".csv")
    }
}

/// An incoming e-mail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Transport-assigned message id.
    pub id: String,
    /// Sender address.
    pub from: String,
    /// Message subject.
    pub subject: String,
    /// When the message arrived.
    pub received_at: DateTime<Utc>,
    /// All attachments, CSV or not.
    pub attachments: Vec<EmailAttachment>,
}

/// A reply captured by the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Id of the message being replied to.
    pub message_id: String,
    /// Reply body.
    pub body: String,
}

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The referenced message is unknown to the transport.
    #[error("message {0} not found")]
    UnknownMessage(String),

    /// Anything the underlying protocol adapter reported.
    #[error("transport failure: {0}")]
    Other(#[from] anyhow::Error),
}

/// Contract every e-mail transport implements.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Short identifier of the bound transport ("mock", "pop3", "imap").
    fn identity(&self) -> &'static str;

    /// Messages that have not been marked processed yet.
    async fn get_new_messages(&self) -> Result<Vec<EmailMessage>, TransportError>;

    /// Send a reply to the original sender of `message_id`.
    async fn send_reply(&self, message_id: &str, body: &str) -> Result<(), TransportError>;

    /// Record that `message_id` has been fully handled.
    async fn mark_processed(&self, message_id: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct MockState {
    messages: Vec<EmailMessage>,
    processed: HashSet<String>,
    replies: Vec<Reply>,
}

/// In-memory transport used by tests and local development.
///
/// Processed ids survive re-seeding: a message marked processed stays
/// invisible even if seeded again under the same id.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the mailbox.
    pub fn seed(&self, message: EmailMessage) {
        self.state.lock().unwrap().messages.push(message);
    }

    /// Drop all messages, processed markers, and captured replies.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.messages.clear();
        state.processed.clear();
        state.replies.clear();
    }

    /// Whether the message has been marked processed.
    pub fn is_processed(&self, message_id: &str) -> bool {
        self.state.lock().unwrap().processed.contains(message_id)
    }

    /// All replies sent so far, in order.
    pub fn replies(&self) -> Vec<Reply> {
        self.state.lock().unwrap().replies.clone()
    }
}

#[async_trait]
impl EmailTransport for MockTransport {
    fn identity(&self) -> &'static str {
        "mock"
    }

    async fn get_new_messages(&self) -> Result<Vec<EmailMessage>, TransportError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|message| !state.processed.contains(&message.id))
            .cloned()
            .collect())
    }

    async fn send_reply(&self, message_id: &str, body: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.messages.iter().any(|message| message.id == message_id) {
            return Err(TransportError::UnknownMessage(message_id.to_string()));
        }
        state.replies.push(Reply {
            message_id: message_id.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.processed.insert(message_id.to_string());
        Ok(())
    }
}
