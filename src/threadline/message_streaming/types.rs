//! Types for conversation update streams.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::threadline::reconciliation::LocalEcho;
use crate::types::Message;

/// What changed in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTrigger {
    /// A message was added through the live transport or the HTTP fallback.
    NewMessage,

    /// A history snapshot was merged; re-read the whole thread.
    HistoryLoaded,

    /// The conversation list gained a peer or a peer profile changed.
    PeerDiscovered,

    /// An outgoing message was handed to a delivery path.
    EchoQueued,

    /// The server confirmed an outgoing message; `message` holds its copy.
    EchoConfirmed,

    /// An outgoing message could not be delivered.
    EchoFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub trigger: UpdateTrigger,

    pub peer_id: String,

    /// The confirmed message this update is about, if any
    pub message: Option<Message>,

    /// The local echo this update is about, if any
    pub echo: Option<LocalEcho>,
}

impl ConversationUpdate {
    pub fn new(trigger: UpdateTrigger, peer_id: impl Into<String>) -> Self {
        Self {
            trigger,
            peer_id: peer_id.into(),
            message: None,
            echo: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_echo(mut self, echo: LocalEcho) -> Self {
        self.echo = Some(echo);
        self
    }
}

/// Non-fatal problems the UI should surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// An outgoing message failed on every delivery path.
    DeliveryFailed {
        local_id: Uuid,
        peer_id: String,
        reason: String,
    },

    /// A history or peer-list request failed.
    FetchFailed { operation: String, reason: String },

    /// The live transport reported a `message-error`.
    TransportError { reason: String },
}

/// Result of subscribing to one conversation.
///
/// The snapshot and the receiver are taken under the same session lock, so no
/// update is lost between them.
pub struct ConversationSubscription {
    pub initial_messages: Vec<Message>,

    pub pending_echoes: Vec<LocalEcho>,

    pub updates: broadcast::Receiver<ConversationUpdate>,
}
