//! Message Streaming Module
//!
//! Pushes conversation changes and non-fatal notices to subscribers as the session
//! processes them, so the UI never has to poll the store.

mod manager;
mod types;

pub use manager::MessageStreamManager;
pub use types::{ConversationSubscription, ConversationUpdate, Notice, UpdateTrigger};
