use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a history batch is merged into the canonical set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeMode {
    /// Insert messages whose id is unknown; nothing is removed.
    #[default]
    Additive,

    /// The conversation with the batch's peer is rebuilt from the batch alone.
    /// Messages of every other conversation are left untouched.
    Replace,
}

/// What a history batch did to the canonical set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryReport {
    /// Messages newly added
    pub inserted: usize,

    /// Messages whose id was already present (including repeats inside the batch)
    pub duplicates: usize,

    /// Messages that do not belong to the conversation the batch was loaded for
    pub skipped: usize,

    /// Messages dropped by a full replace that the new batch no longer contains
    pub removed: usize,

    /// Whether the batch made its peer known to the store
    pub discovered_peer: bool,
}

impl HistoryReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.removed > 0 || self.discovered_peer
    }
}

/// Result of merging one live message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted {
        peer_id: String,
        /// The message introduced a peer that was not in the known-peers list
        discovered_peer: bool,
    },
    /// A message with the same id is already held; nothing changed.
    Duplicate { peer_id: String },
}

impl IngestOutcome {
    pub fn peer_id(&self) -> &str {
        match self {
            IngestOutcome::Inserted { peer_id, .. } | IngestOutcome::Duplicate { peer_id } => {
                peer_id
            }
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, IngestOutcome::Inserted { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid message {message_id}: {reason}")]
    InvalidMessage { message_id: String, reason: String },
}
