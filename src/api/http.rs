use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{FallbackSender, FetchError, HistoryFetcher, Result, SendMessageRequest};
use crate::types::{Message, PeerSummary};

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    #[serde(default)]
    users: Vec<PeerSummary>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    error: Option<String>,
}

/// reqwest-backed client for the messages REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpMessagesClient {
    client: Client,
    base_url: Url,
}

impl HttpMessagesClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl HistoryFetcher for HttpMessagesClient {
    async fn get_conversation_peers(&self, user_id: &str) -> Result<Vec<PeerSummary>> {
        let url = self.endpoint(&["messages", "conversations", user_id])?;
        tracing::debug!(
            target: "threadline::api::get_conversation_peers",
            "GET {}",
            url
        );
        let response = self.client.get(url).send().await?;
        let body: PeersResponse = Self::read_json(response).await?;
        Ok(body.users)
    }

    async fn get_history(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>> {
        let url = self.endpoint(&["messages", user_id, peer_id])?;
        tracing::debug!(target: "threadline::api::get_history", "GET {}", url);
        let response = self.client.get(url).send().await?;
        let body: HistoryResponse = Self::read_json(response).await?;

        let mut messages = body.messages;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

#[async_trait]
impl FallbackSender for HttpMessagesClient {
    async fn post_message(&self, request: &SendMessageRequest) -> Result<Message> {
        let url = self.endpoint(&["messages"])?;
        tracing::debug!(
            target: "threadline::api::post_message",
            "POST {} (receiver {})",
            url,
            request.receiver_id
        );
        let response = self.client.post(url).json(request).send().await?;
        let body: SendResponse = Self::read_json(response).await?;

        match (body.success, body.message) {
            (true, Some(message)) => Ok(message),
            (true, None) => Err(FetchError::Rejected(
                "response did not include the created message".to_string(),
            )),
            (false, _) => Err(FetchError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }
}
