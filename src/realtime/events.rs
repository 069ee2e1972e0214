//! Frames exchanged with the realtime server.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::Message;

/// Names of the inbound events a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundEventKind {
    NewMessage,
    MessageSent,
    MessageError,
}

impl InboundEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundEventKind::NewMessage => "new-message",
            InboundEventKind::MessageSent => "message-sent",
            InboundEventKind::MessageError => "message-error",
        }
    }
}

impl fmt::Display for InboundEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboundEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new-message" => Ok(InboundEventKind::NewMessage),
            "message-sent" => Ok(InboundEventKind::MessageSent),
            "message-error" => Ok(InboundEventKind::MessageError),
            other => Err(format!("Unknown inbound event: {}", other)),
        }
    }
}

/// Events pushed by the server over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// A message addressed to (or sent by) the local user was created.
    NewMessage { message: Message },

    /// Acknowledgment of a `send-message` emitted by this client.
    MessageSent {
        success: bool,
        #[serde(default)]
        message: Option<Message>,
    },

    /// The server could not deliver a `send-message` emitted by this client.
    MessageError {
        #[serde(default)]
        error: Option<String>,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> InboundEventKind {
        match self {
            InboundEvent::NewMessage { .. } => InboundEventKind::NewMessage,
            InboundEvent::MessageSent { .. } => InboundEventKind::MessageSent,
            InboundEvent::MessageError { .. } => InboundEventKind::MessageError,
        }
    }
}

/// Events this client emits over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    SendMessage {
        sender_id: String,
        receiver_id: String,
        content: String,
    },

    /// Presence announcement, emitted once per successful open.
    UserOnline { user_id: String },
}
