use thiserror::Error;

use crate::api::FetchError;
use crate::realtime::TransportError;
use crate::threadline::reconciliation::StoreError;

pub type Result<T> = core::result::Result<T, ThreadlineError>;

#[derive(Error, Debug)]
pub enum ThreadlineError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("A non-empty user id is required")]
    InvalidUserId,

    #[error("A message needs content or an attachment")]
    EmptyMessage,

    #[error("No outgoing message with local id {0}")]
    EchoNotFound(uuid::Uuid),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
