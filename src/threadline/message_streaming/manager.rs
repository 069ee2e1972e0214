//! Broadcast channels for conversation updates.
//!
//! Per-peer streams are created lazily on subscribe and cleaned up on emit once
//! every receiver is gone. A session-wide stream carries every update (used by
//! the conversation list) and a separate one carries notices.

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::types::{ConversationUpdate, Notice};

const BUFFER_SIZE: usize = 100;

pub struct MessageStreamManager {
    streams: DashMap<String, broadcast::Sender<ConversationUpdate>>,
    all: broadcast::Sender<ConversationUpdate>,
    notices: broadcast::Sender<Notice>,
}

impl MessageStreamManager {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            all: broadcast::channel(BUFFER_SIZE).0,
            notices: broadcast::channel(BUFFER_SIZE).0,
        }
    }

    pub fn subscribe(&self, peer_id: &str) -> broadcast::Receiver<ConversationUpdate> {
        self.streams
            .entry(peer_id.to_string())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.all.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn emit(&self, update: ConversationUpdate) {
        let peer_id = update.peer_id.clone();
        let _ = self.all.send(update.clone());

        if let Some(sender) = self.streams.get(&peer_id) {
            // Attempt to send; if all receivers dropped, clean up
            if sender.send(update).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.streams.remove(&peer_id);
            }
        }
    }

    pub fn notify(&self, notice: Notice) {
        tracing::debug!(
            target: "threadline::message_streaming::notify",
            "Notice: {:?}",
            notice
        );
        let _ = self.notices.send(notice);
    }

    /// Drops every per-peer stream so their receivers observe the end of the
    /// session.
    pub fn close_conversations(&self) {
        self.streams.clear();
    }
}

impl Default for MessageStreamManager {
    fn default() -> Self {
        Self::new()
    }
}
