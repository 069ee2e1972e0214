use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier as the backend sends it: `id`, the document key `_id`, or both.
/// `id` wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "_id", default, skip_serializing)]
    document_id: Option<String>,
}

impl WireId {
    fn new(id: String) -> Self {
        Self {
            id: Some(id),
            document_id: None,
        }
    }

    fn resolve(self, record: &str) -> Result<String, String> {
        first_present([self.id, self.document_id])
            .ok_or_else(|| format!("{} has neither `id` nor `_id`", record))
    }
}

/// First value that is present and not empty.
fn first_present<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
}

/// A post shared into a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSharedPost")]
pub struct SharedPost {
    pub id: String,
    pub content: String,
}

#[derive(Deserialize)]
struct WireSharedPost {
    #[serde(flatten)]
    id: WireId,
    #[serde(default)]
    content: String,
}

impl TryFrom<WireSharedPost> for SharedPost {
    type Error = String;

    fn try_from(wire: WireSharedPost) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id.resolve("post")?,
            content: wire.content,
        })
    }
}

/// An event shared into a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSharedEvent")]
pub struct SharedEvent {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
struct WireSharedEvent {
    #[serde(flatten)]
    id: WireId,
    #[serde(default)]
    name: String,
}

impl TryFrom<WireSharedEvent> for SharedEvent {
    type Error = String;

    fn try_from(wire: WireSharedEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id.resolve("event")?,
            name: wire.name,
        })
    }
}

/// The single thing a message may point at besides its text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachedRef {
    Post(SharedPost),
    Event(SharedEvent),
}

/// A direct message as assigned by the server.
///
/// Messages are immutable once created. The `id` is the only identity used for
/// deduplication; `created_at` only orders messages within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    /// Server-assigned identifier, never regenerated client-side
    pub id: String,

    pub sender_id: String,

    pub receiver_id: String,

    /// Text body (may be empty when the message only carries an attachment)
    pub content: String,

    pub attached_ref: Option<AttachedRef>,

    /// Authoritative ordering key within a conversation
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Returns the participant that is not `user_id`, or `None` when `user_id`
    /// takes no part in this message.
    ///
    /// A message a user sends to themselves belongs to the conversation with
    /// themselves.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.sender_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Whether this message belongs to the conversation between `a` and `b`,
    /// regardless of direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// Short text used for conversation list previews.
    ///
    /// Precedence: shared post content, then shared event name, then raw content.
    pub fn summary(&self) -> &str {
        match &self.attached_ref {
            Some(AttachedRef::Post(post)) => &post.content,
            Some(AttachedRef::Event(event)) => &event.name,
            None => &self.content,
        }
    }
}

/// Message shape exchanged with the backend, where attachments are optional
/// sub-objects on a flat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(flatten)]
    id: WireId,
    sender_id: String,
    receiver_id: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    post: Option<SharedPost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<SharedEvent>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        // The post wins when a record carries both, same as summary precedence.
        let attached_ref = match (wire.post, wire.event) {
            (Some(post), _) => Some(AttachedRef::Post(post)),
            (None, Some(event)) => Some(AttachedRef::Event(event)),
            (None, None) => None,
        };
        Ok(Self {
            id: wire.id.resolve("message")?,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            content: wire.content,
            attached_ref,
            created_at: wire.created_at,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let (post, event) = match message.attached_ref {
            Some(AttachedRef::Post(post)) => (Some(post), None),
            Some(AttachedRef::Event(event)) => (None, Some(event)),
            None => (None, None),
        };
        Self {
            id: WireId::new(message.id),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            post,
            event,
            created_at: message.created_at,
        }
    }
}

/// Profile summary of a conversation peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WirePeer")]
pub struct PeerSummary {
    pub id: String,

    /// Display name shown in the conversation list
    pub name: String,

    /// Avatar reference (URL or asset key)
    pub avatar: Option<String>,
}

/// User record as returned by the backend. Several name and avatar keys may be
/// present at once.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePeer {
    #[serde(flatten)]
    id: WireId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    profile_picture: Option<String>,
}

impl TryFrom<WirePeer> for PeerSummary {
    type Error = String;

    fn try_from(wire: WirePeer) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id.resolve("user")?,
            name: first_present([wire.name, wire.display_name, wire.username])
                .unwrap_or_default(),
            avatar: first_present([wire.avatar, wire.profile_picture]),
        })
    }
}

impl PeerSummary {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    /// Placeholder for a peer first seen through a message, before any profile
    /// data is known. The id doubles as the display name.
    pub fn placeholder(id: &str) -> Self {
        Self::new(id, id)
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// The identity a session is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Attachment chosen when composing an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentRequest {
    Post { post_id: String },
    Event { event_id: String },
}
