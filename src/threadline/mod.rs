use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

pub mod conversations;
pub mod error;
mod event_processing;
pub mod message_streaming;
pub mod messages;
pub mod projector;
pub mod reconciliation;

use crate::api::{FallbackSender, HistoryFetcher, HttpMessagesClient};
use crate::init_tracing;
use crate::realtime::{ConnectionState, RealtimeConnector, TransportAdapter, WebSocketConnector};
use crate::types::LocalUser;
use error::{Result, ThreadlineError};
use message_streaming::{ConversationUpdate, MessageStreamManager, Notice};
use projector::{ConversationProjector, ConversationSummary};
use reconciliation::{Outbox, ReconciliationStore};

const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:5000";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ThreadlineConfig {
    /// Base URL of the messages REST API
    pub api_base_url: String,

    /// URL of the realtime websocket endpoint
    pub socket_url: String,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,

    /// Delay between websocket reconnect attempts
    pub reconnect_delay: Duration,
}

impl ThreadlineConfig {
    pub fn new(api_base_url: &str, socket_url: &str, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            api_base_url: api_base_url.to_string(),
            socket_url: socket_url.to_string(),
            logs_dir: logs_dir.join(env_suffix),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Reads `THREADLINE_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is not an error
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key/value source using the same keys as
    /// [`ThreadlineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url =
            lookup("THREADLINE_API_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let socket_url =
            lookup("THREADLINE_SOCKET_URL").unwrap_or_else(|| DEFAULT_SOCKET_URL.to_string());
        let logs_dir = lookup("THREADLINE_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));

        let mut config = Self::new(&api_base_url, &socket_url, &logs_dir);

        if let Some(value) = lookup("THREADLINE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse_number("THREADLINE_REQUEST_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("THREADLINE_RECONNECT_DELAY_MS") {
            config.reconnect_delay =
                Duration::from_millis(parse_number("THREADLINE_RECONNECT_DELAY_MS", &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("socket_url", &self.socket_url, &["ws", "wss"])?;
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        ThreadlineError::Configuration(format!("{} must be a whole number: {}", key, e))
    })
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| ThreadlineError::Configuration(format!("Invalid {}: {}", field, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ThreadlineError::Configuration(format!(
            "{} must use one of {:?}, got {}",
            field,
            schemes,
            url.scheme()
        )));
    }
    Ok(())
}

/// Everything that lives exactly as long as one login.
struct SessionState {
    /// Distinguishes this login from earlier ones so late results can be dropped
    generation: u64,
    user: LocalUser,
    store: ReconciliationStore,
    outbox: Outbox,
    projector: ConversationProjector,
}

impl SessionState {
    fn new(generation: u64, user: LocalUser) -> Self {
        Self {
            generation,
            store: ReconciliationStore::new(user.id.clone()),
            user,
            outbox: Outbox::new(),
            projector: ConversationProjector::new(),
        }
    }
}

/// Returns the session only if it is still the one identified by `generation`.
fn live_session(slot: &mut Option<SessionState>, generation: u64) -> Option<&mut SessionState> {
    slot.as_mut().filter(|state| state.generation == generation)
}

struct EventWorker {
    shutdown_sender: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Client-side messaging session: one live connection, one canonical message
/// set, and the views derived from it.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Threadline {
    pub config: ThreadlineConfig,
    transport: TransportAdapter,
    history: Arc<dyn HistoryFetcher>,
    fallback: Arc<dyn FallbackSender>,
    streams: Arc<MessageStreamManager>,
    session: Arc<Mutex<Option<SessionState>>>,
    worker: Arc<Mutex<Option<EventWorker>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for Threadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threadline")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("history", &"<REDACTED>")
            .field("fallback", &"<REDACTED>")
            .finish()
    }
}

impl Threadline {
    /// Builds a session around explicit collaborators.
    pub fn new(
        config: ThreadlineConfig,
        connector: Arc<dyn RealtimeConnector>,
        history: Arc<dyn HistoryFetcher>,
        fallback: Arc<dyn FallbackSender>,
    ) -> Self {
        Self {
            config,
            transport: TransportAdapter::new(connector),
            history,
            fallback,
            streams: Arc::new(MessageStreamManager::new()),
            session: Arc::new(Mutex::new(None)),
            worker: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets up logging and wires the websocket connector and the HTTP client
    /// described by `config`.
    pub fn from_config(config: ThreadlineConfig) -> Result<Self> {
        config.validate()?;

        let logs_dir = &config.logs_dir;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(ThreadlineError::from)?;

        init_tracing(logs_dir)?;

        tracing::debug!(
            target: "threadline::from_config",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let connector = Arc::new(WebSocketConnector::new(
            config.socket_url.clone(),
            config.reconnect_delay,
        ));
        let client = Arc::new(HttpMessagesClient::new(
            &config.api_base_url,
            config.request_timeout,
        )?);

        Ok(Self::new(config, connector, client.clone(), client))
    }

    /// Starts a session for `user`, replacing any session already running.
    ///
    /// The session survives a failed peer-list fetch: the error is returned, and
    /// [`Threadline::refresh_conversations`] can be called to try again.
    pub async fn login(&self, user: LocalUser) -> Result<Vec<ConversationSummary>> {
        if user.id.trim().is_empty() {
            return Err(ThreadlineError::InvalidUserId);
        }

        self.logout().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session.lock().await = Some(SessionState::new(generation, user.clone()));

        tracing::info!(
            target: "threadline::login",
            "Starting session {} for user {}",
            generation,
            user.id
        );

        self.start_event_processing(generation).await;
        self.transport.connect(&user.id).await?;

        self.refresh_conversations().await
    }

    /// Ends the current session. Safe to call without one.
    pub async fn logout(&self) {
        self.shutdown_event_processing().await;
        self.transport.disconnect().await;

        let previous = self.session.lock().await.take();
        self.streams.close_conversations();

        if let Some(state) = previous {
            tracing::info!(
                target: "threadline::logout",
                "Ended session {} for user {}",
                state.generation,
                state.user.id
            );
        }
    }

    pub async fn active_user(&self) -> Option<LocalUser> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|state| state.user.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Every conversation update of the session, for list screens.
    pub fn subscribe_to_conversation_list(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.streams.subscribe_all()
    }

    pub fn subscribe_to_notices(&self) -> broadcast::Receiver<Notice> {
        self.streams.subscribe_notices()
    }

    /// Runs `f` against the active session.
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SessionState) -> T,
    {
        let mut slot = self.session.lock().await;
        let state = slot.as_mut().ok_or(ThreadlineError::NoActiveSession)?;
        Ok(f(state))
    }

    /// Runs `f` only if the session identified by `generation` is still active.
    async fn with_live_session<T, F>(&self, generation: u64, f: F) -> Option<T>
    where
        F: FnOnce(&mut SessionState) -> T,
    {
        let mut slot = self.session.lock().await;
        match live_session(&mut slot, generation) {
            Some(state) => Some(f(state)),
            None => {
                tracing::debug!(
                    target: "threadline::session",
                    "Session {} is no longer active, dropping result",
                    generation
                );
                None
            }
        }
    }
}
