//! Request/response collaborators of the messaging backend.
//!
//! [`HistoryFetcher`] loads conversation peers and message history; it never
//! merges or deduplicates. [`FallbackSender`] is the HTTP send path used when the
//! live transport is unavailable or reports a delivery error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttachmentRequest, Message, PeerSummary};

pub mod http;

pub use http::HttpMessagesClient;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Server rejected the request: {0}")]
    Rejected(String),
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// Peers the user has exchanged messages with.
    async fn get_conversation_peers(&self, user_id: &str) -> Result<Vec<PeerSummary>>;

    /// Every message between the two users, oldest first.
    async fn get_history(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait FallbackSender: Send + Sync {
    /// Creates the message over HTTP and returns the server-confirmed copy.
    async fn post_message(&self, request: &SendMessageRequest) -> Result<Message>;
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl SendMessageRequest {
    pub fn new(
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        attachment: Option<&AttachmentRequest>,
    ) -> Self {
        let (post_id, event_id) = match attachment {
            Some(AttachmentRequest::Post { post_id }) => (Some(post_id.clone()), None),
            Some(AttachmentRequest::Event { event_id }) => (None, Some(event_id.clone())),
            None => (None, None),
        };
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            post_id,
            event_id,
        }
    }
}
