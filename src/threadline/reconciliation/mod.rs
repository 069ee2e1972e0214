//! Reconciliation Store
//!
//! Owns the canonical message set of one logged-in user. History batches and live
//! pushes both funnel into this store; the message id is the only dedup key and
//! `created_at` is only used for ordering inside a conversation.

mod outbox;
mod types;


pub use outbox::{DeliveryRoute, EchoStatus, LocalEcho, Outbox};
pub use types::{HistoryReport, IngestOutcome, MergeMode, StoreError};

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::types::{Message, PeerSummary};

/// Sort key of a message inside its conversation; the id breaks timestamp ties.
type OrderKey = (DateTime<Utc>, String);

#[derive(Debug, Default)]
struct Conversation {
    order: BTreeSet<OrderKey>,
    revision: u64,
}

#[derive(Debug)]
pub struct ReconciliationStore {
    user_id: String,
    messages: HashMap<String, Message>,
    conversations: HashMap<String, Conversation>,
    /// Known peers in discovery order
    peers: Vec<PeerSummary>,
    peer_positions: HashMap<String, usize>,
    revision: u64,
}

impl ReconciliationStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: HashMap::new(),
            conversations: HashMap::new(),
            peers: Vec::new(),
            peer_positions: HashMap::new(),
            revision: 0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Upserts peer profiles. New peers are appended in the order given; known
    /// peers keep their position and get the fresh profile.
    ///
    /// Returns the ids of peers that were not known before.
    pub fn register_peers<I>(&mut self, peers: I) -> Vec<String>
    where
        I: IntoIterator<Item = PeerSummary>,
    {
        let mut discovered = Vec::new();
        for mut peer in peers {
            if peer.id.is_empty() {
                continue;
            }
            if peer.name.is_empty() {
                peer.name = peer.id.clone();
            }

            match self.peer_positions.get(&peer.id) {
                Some(&position) => {
                    if self.peers[position] != peer {
                        self.peers[position] = peer;
                        self.revision += 1;
                    }
                }
                None => {
                    discovered.push(peer.id.clone());
                    self.push_peer(peer);
                }
            }
        }
        discovered
    }

    /// Merges a history snapshot for the conversation with `peer_id`.
    ///
    /// Messages outside the `{user, peer}` pair are skipped and counted. In
    /// [`MergeMode::Replace`] the conversation ends up holding exactly the batch;
    /// messages already held under the same id keep their first copy.
    pub fn ingest_history_batch(
        &mut self,
        peer_id: &str,
        messages: Vec<Message>,
        mode: MergeMode,
    ) -> HistoryReport {
        let held = (mode == MergeMode::Replace).then(|| self.conversation_ids(peer_id));
        self.merge_history(peer_id, messages, mode, held.as_ref())
    }

    /// Replaces the conversation with `peer_id` by a batch fetched while the
    /// store held `held_at_issue` for it.
    ///
    /// Only messages in `held_at_issue` that the batch no longer contains are
    /// removed. Anything merged after the fetch was issued is newer than the
    /// batch and stays.
    pub fn replace_history(
        &mut self,
        peer_id: &str,
        messages: Vec<Message>,
        held_at_issue: &HashSet<String>,
    ) -> HistoryReport {
        self.merge_history(peer_id, messages, MergeMode::Replace, Some(held_at_issue))
    }

    /// Ids currently held for the conversation with `peer_id`.
    pub fn conversation_ids(&self, peer_id: &str) -> HashSet<String> {
        self.conversations
            .get(peer_id)
            .map(|conversation| conversation.order.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn merge_history(
        &mut self,
        peer_id: &str,
        messages: Vec<Message>,
        mode: MergeMode,
        prunable: Option<&HashSet<String>>,
    ) -> HistoryReport {
        let mut report = HistoryReport::default();

        let batch: Vec<Message> = messages
            .into_iter()
            .filter(|message| {
                let belongs = !message.id.is_empty() && message.is_between(&self.user_id, peer_id);
                if !belongs {
                    report.skipped += 1;
                }
                belongs
            })
            .collect();

        if report.skipped > 0 {
            tracing::warn!(
                target: "threadline::reconciliation::ingest_history_batch",
                "Skipped {} message(s) outside the conversation with {}",
                report.skipped,
                peer_id
            );
        }

        if let Some(prunable) = prunable {
            let incoming: HashSet<&str> = batch.iter().map(|m| m.id.as_str()).collect();
            let stale: Vec<OrderKey> = self
                .conversations
                .get(peer_id)
                .map(|conversation| {
                    conversation
                        .order
                        .iter()
                        .filter(|(_, id)| {
                            prunable.contains(id) && !incoming.contains(id.as_str())
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            report.removed = stale.len();
            for key in stale {
                self.remove(peer_id, &key);
            }
        }

        for message in batch {
            if self.messages.contains_key(&message.id) {
                report.duplicates += 1;
                continue;
            }
            if self.ensure_peer(peer_id) {
                report.discovered_peer = true;
            }
            self.insert(peer_id, message);
            report.inserted += 1;
        }

        tracing::debug!(
            target: "threadline::reconciliation::ingest_history_batch",
            "History for {} ({:?}): {} inserted, {} duplicate, {} removed",
            peer_id,
            mode,
            report.inserted,
            report.duplicates,
            report.removed
        );

        report
    }

    /// Merges a single message pushed over the live transport.
    ///
    /// A message the local user takes no part in is rejected without touching
    /// the store. A known id is a no-op.
    pub fn ingest_live_message(&mut self, message: Message) -> Result<IngestOutcome, StoreError> {
        if message.id.is_empty() {
            return Err(StoreError::InvalidMessage {
                message_id: message.id,
                reason: "message has no id".to_string(),
            });
        }

        let Some(peer_id) = message.peer_of(&self.user_id).map(str::to_string) else {
            return Err(StoreError::InvalidMessage {
                reason: format!(
                    "neither sender {} nor receiver {} is the local user",
                    message.sender_id, message.receiver_id
                ),
                message_id: message.id,
            });
        };

        if self.messages.contains_key(&message.id) {
            tracing::debug!(
                target: "threadline::reconciliation::ingest_live_message",
                "Message {} already held, ignoring",
                message.id
            );
            return Ok(IngestOutcome::Duplicate { peer_id });
        }

        let discovered_peer = self.ensure_peer(&peer_id);
        self.insert(&peer_id, message);

        Ok(IngestOutcome::Inserted {
            peer_id,
            discovered_peer,
        })
    }

    /// Messages between `user_id` and `peer_id`, oldest first, ties broken by id.
    pub fn get_messages_for_conversation(&self, user_id: &str, peer_id: &str) -> Vec<Message> {
        let peer = if user_id == self.user_id {
            peer_id
        } else if peer_id == self.user_id {
            user_id
        } else {
            return Vec::new();
        };
        self.conversation_messages(peer)
    }

    pub fn conversation_messages(&self, peer_id: &str) -> Vec<Message> {
        self.conversations
            .get(peer_id)
            .map(|conversation| {
                conversation
                    .order
                    .iter()
                    .filter_map(|(_, id)| self.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The message with the greatest `created_at`, ties broken by the greater id.
    pub fn last_message(&self, peer_id: &str) -> Option<&Message> {
        let (_, id) = self.conversations.get(peer_id)?.order.last()?;
        self.messages.get(id)
    }

    /// Preview text of the last message; empty when the conversation has none.
    pub fn get_last_message_summary(&self, peer_id: &str) -> String {
        self.last_message(peer_id)
            .map(|message| message.summary().to_string())
            .unwrap_or_default()
    }

    pub fn peers(&self) -> &[PeerSummary] {
        &self.peers
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerSummary> {
        self.peer_positions
            .get(peer_id)
            .map(|&position| &self.peers[position])
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bumped on every mutation of messages or peers.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Bumped whenever the message set of the conversation with `peer_id` changes.
    pub fn peer_revision(&self, peer_id: &str) -> u64 {
        self.conversations
            .get(peer_id)
            .map(|conversation| conversation.revision)
            .unwrap_or(0)
    }

    fn push_peer(&mut self, peer: PeerSummary) {
        tracing::debug!(
            target: "threadline::reconciliation::peers",
            "Discovered peer {}",
            peer.id
        );
        self.peer_positions.insert(peer.id.clone(), self.peers.len());
        self.peers.push(peer);
        self.revision += 1;
    }

    /// Adds a placeholder profile for a peer first seen through a message.
    fn ensure_peer(&mut self, peer_id: &str) -> bool {
        if self.peer_positions.contains_key(peer_id) {
            return false;
        }
        self.push_peer(PeerSummary::placeholder(peer_id));
        true
    }

    fn insert(&mut self, peer_id: &str, message: Message) {
        let conversation = self.conversations.entry(peer_id.to_string()).or_default();
        conversation
            .order
            .insert((message.created_at, message.id.clone()));
        conversation.revision += 1;
        self.messages.insert(message.id.clone(), message);
        self.revision += 1;
    }

    fn remove(&mut self, peer_id: &str, key: &OrderKey) {
        if let Some(conversation) = self.conversations.get_mut(peer_id)
            && conversation.order.remove(key)
        {
            conversation.revision += 1;
            self.messages.remove(&key.1);
            self.revision += 1;
        }
    }
}
