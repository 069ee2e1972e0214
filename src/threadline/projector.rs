use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::threadline::reconciliation::{LocalEcho, Outbox, ReconciliationStore};
use crate::types::{Message, PeerSummary};

/// One row of the conversation list screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub peer: PeerSummary,

    /// Preview of the last message (empty if no messages are loaded yet)
    pub last_message_summary: String,

    /// When the last message was created (None if no messages are loaded yet)
    pub last_message_at: Option<DateTime<Utc>>,
}

/// The messages of one conversation as the thread screen shows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub peer: PeerSummary,

    /// Confirmed messages, oldest first
    pub messages: Arc<Vec<Message>>,

    /// Outgoing messages still waiting for confirmation or marked as failed
    pub echoes: Vec<LocalEcho>,
}

impl ThreadView {
    pub fn build(store: &ReconciliationStore, outbox: &Outbox, peer_id: &str) -> Self {
        Self {
            peer: resolve_peer(store, peer_id),
            messages: Arc::new(store.conversation_messages(peer_id)),
            echoes: outbox.for_peer(peer_id),
        }
    }
}

/// Case-insensitive prefix match on the display name. An empty filter matches
/// every peer.
fn matches_filter(peer: &PeerSummary, filter_lowercase: &str) -> bool {
    filter_lowercase.is_empty() || peer.name.to_lowercase().starts_with(filter_lowercase)
}

fn resolve_peer(store: &ReconciliationStore, peer_id: &str) -> PeerSummary {
    store
        .peer(peer_id)
        .cloned()
        .unwrap_or_else(|| PeerSummary::placeholder(peer_id))
}

fn summarize(store: &ReconciliationStore, peer: &PeerSummary) -> ConversationSummary {
    let last = store.last_message(&peer.id);
    ConversationSummary {
        peer: peer.clone(),
        last_message_summary: last.map(|m| m.summary().to_string()).unwrap_or_default(),
        last_message_at: last.map(|m| m.created_at),
    }
}

#[derive(Debug)]
struct CachedThread {
    peer_id: String,
    peer_revision: u64,
    messages: Arc<Vec<Message>>,
}

/// UI-side selection state plus the derived views built from the store.
#[derive(Debug, Default)]
pub struct ConversationProjector {
    active_peer: Option<String>,
    cache: Option<CachedThread>,
}

impl ConversationProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversations whose peer name starts with `filter_text`, in the order the
    /// peers were discovered.
    pub fn list_conversations(
        store: &ReconciliationStore,
        filter_text: &str,
    ) -> Vec<ConversationSummary> {
        let filter = filter_text.to_lowercase();
        store
            .peers()
            .iter()
            .filter(|peer| matches_filter(peer, &filter))
            .map(|peer| summarize(store, peer))
            .collect()
    }

    pub fn select_conversation(&mut self, peer_id: &str) {
        if self.active_peer.as_deref() != Some(peer_id) {
            self.active_peer = Some(peer_id.to_string());
        }
    }

    pub fn clear_selection(&mut self) {
        self.active_peer = None;
        self.cache = None;
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    /// Thread of the active peer, or None when nothing is selected.
    ///
    /// The message list is rebuilt only when the store reports a change for the
    /// active peer; echoes are always read fresh from the outbox.
    pub fn current_thread(
        &mut self,
        store: &ReconciliationStore,
        outbox: &Outbox,
    ) -> Option<ThreadView> {
        let peer_id = self.active_peer.clone()?;
        let peer_revision = store.peer_revision(&peer_id);

        let messages = match &self.cache {
            Some(cached) if cached.peer_id == peer_id && cached.peer_revision == peer_revision => {
                cached.messages.clone()
            }
            _ => {
                let messages = Arc::new(store.conversation_messages(&peer_id));
                self.cache = Some(CachedThread {
                    peer_id: peer_id.clone(),
                    peer_revision,
                    messages: messages.clone(),
                });
                messages
            }
        };

        Some(ThreadView {
            peer: resolve_peer(store, &peer_id),
            messages,
            echoes: outbox.for_peer(&peer_id),
        })
    }
}
