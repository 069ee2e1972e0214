//! Optimistic local echoes of outgoing messages.
//!
//! An echo is what the UI shows between pressing send and the server confirming
//! the message. Echoes carry a client-generated `local_id` and never enter the
//! canonical message set; the server-confirmed [`Message`] does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AttachmentRequest, Message};

/// Path an outgoing message took (or is taking) to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryRoute {
    Socket,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoStatus {
    /// Waiting for the server to acknowledge the message
    Pending,
    /// Both delivery paths gave up; the UI shows a "not sent" marker
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEcho {
    pub local_id: Uuid,
    pub receiver_id: String,
    pub content: String,
    pub attachment: Option<AttachmentRequest>,
    /// Local clock; only used to order echoes after confirmed messages
    pub created_at: DateTime<Utc>,
    pub route: DeliveryRoute,
    pub status: EchoStatus,
}

impl LocalEcho {
    pub fn is_pending(&self) -> bool {
        self.status == EchoStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, EchoStatus::Failed { .. })
    }

    /// Whether `message` is the server copy of this echo as reported by a socket
    /// acknowledgment. The socket frame carries no client id, so the match is on
    /// receiver and body.
    fn acknowledged_by(&self, message: &Message) -> bool {
        self.route == DeliveryRoute::Socket
            && self.is_pending()
            && self.attachment.is_none()
            && self.receiver_id == message.receiver_id
            && self.content == message.content
    }
}

/// Outgoing messages not yet confirmed, in the order they were sent.
#[derive(Debug, Default)]
pub struct Outbox {
    echoes: Vec<LocalEcho>,
    revision: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        receiver_id: &str,
        content: &str,
        attachment: Option<AttachmentRequest>,
        route: DeliveryRoute,
    ) -> LocalEcho {
        let echo = LocalEcho {
            local_id: Uuid::new_v4(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            attachment,
            created_at: Utc::now(),
            route,
            status: EchoStatus::Pending,
        };
        self.echoes.push(echo.clone());
        self.revision += 1;
        echo
    }

    pub fn get(&self, local_id: &Uuid) -> Option<&LocalEcho> {
        self.echoes.iter().find(|echo| echo.local_id == *local_id)
    }

    /// Puts an echo back into the pending state on `route`.
    pub fn mark_pending(&mut self, local_id: &Uuid, route: DeliveryRoute) -> Option<LocalEcho> {
        self.update(local_id, |echo| {
            echo.route = route;
            echo.status = EchoStatus::Pending;
        })
    }

    pub fn mark_failed(&mut self, local_id: &Uuid, reason: impl Into<String>) -> Option<LocalEcho> {
        let reason = reason.into();
        self.update(local_id, |echo| {
            echo.status = EchoStatus::Failed { reason };
        })
    }

    pub fn remove(&mut self, local_id: &Uuid) -> Option<LocalEcho> {
        let position = self
            .echoes
            .iter()
            .position(|echo| echo.local_id == *local_id)?;
        self.revision += 1;
        Some(self.echoes.remove(position))
    }

    /// Removes and returns the oldest pending socket echo that `message`
    /// acknowledges.
    pub fn confirm_socket_echo(&mut self, message: &Message) -> Option<LocalEcho> {
        let position = self
            .echoes
            .iter()
            .position(|echo| echo.acknowledged_by(message))?;
        self.revision += 1;
        Some(self.echoes.remove(position))
    }

    /// The socket send a negative acknowledgment most likely refers to.
    pub fn oldest_pending_socket(&self) -> Option<&LocalEcho> {
        self.echoes
            .iter()
            .find(|echo| echo.route == DeliveryRoute::Socket && echo.is_pending())
    }

    pub fn for_peer(&self, peer_id: &str) -> Vec<LocalEcho> {
        self.echoes
            .iter()
            .filter(|echo| echo.receiver_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.echoes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.echoes.is_empty()
    }

    /// Bumped on every change; lets cached thread views notice echo updates.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn update<F>(&mut self, local_id: &Uuid, apply: F) -> Option<LocalEcho>
    where
        F: FnOnce(&mut LocalEcho),
    {
        let echo = self
            .echoes
            .iter_mut()
            .find(|echo| echo.local_id == *local_id)?;
        apply(echo);
        self.revision += 1;
        Some(echo.clone())
    }
}
