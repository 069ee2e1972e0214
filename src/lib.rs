use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::path::Path;
use std::sync::Mutex;

pub mod api;
pub mod realtime;
mod threadline;
pub mod types;

pub use crate::threadline::error::{Result, ThreadlineError};
pub use crate::threadline::message_streaming::{
    ConversationSubscription, ConversationUpdate, Notice, UpdateTrigger,
};
pub use crate::threadline::messages::SendReceipt;
pub use crate::threadline::projector::{ConversationProjector, ConversationSummary, ThreadView};
pub use crate::threadline::reconciliation::{
    DeliveryRoute, EchoStatus, HistoryReport, IngestOutcome, LocalEcho, MergeMode,
    ReconciliationStore, StoreError,
};
pub use crate::threadline::{Threadline, ThreadlineConfig};

pub use crate::api::{FallbackSender, FetchError, HistoryFetcher, HttpMessagesClient};
pub use crate::realtime::{ConnectionState, RealtimeConnector, TransportAdapter, TransportError};
pub use crate::types::{AttachedRef, AttachmentRequest, LocalUser, Message, PeerSummary};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the stdout and daily-rolling file layers. Later calls are no-ops.
pub(crate) fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("threadline")
            .filename_suffix("log")
            .build(logs_dir)
            .map_err(|e| ThreadlineError::LoggingSetup(e.to_string()))?;

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // A subscriber installed by the host application wins
        let installed = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .is_ok();
        if !installed {
            tracing::debug!(
                target: "threadline::init_tracing",
                "Global tracing subscriber already set, keeping it"
            );
        }

        Ok::<(), ThreadlineError>(())
    })?;
    Ok(())
}
