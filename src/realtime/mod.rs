//! Transport adapter for the live messaging connection.
//!
//! The adapter owns at most one connection per logged-in user and exposes a small
//! surface on top of it: connect/disconnect, fire-and-forget sends, and one handler
//! per inbound event name. Reconnection is left to the [`RealtimeConnector`]; the
//! adapter only re-announces presence every time the connector reports the link
//! as open again.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

pub mod events;
pub mod websocket;

pub use events::{InboundEvent, InboundEventKind, OutboundEvent};
pub use websocket::WebSocketConnector;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("A user id is required to connect")]
    InvalidUserId,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Frame serialization error: {0}")]
    Frame(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a connector reports back about its link.
#[derive(Debug)]
pub enum TransportSignal {
    /// The link is open (first open or any reopen after a drop).
    Open,
    /// An inbound event arrived.
    Event(InboundEvent),
    /// The link dropped. The connector may reopen it on its own.
    Dropped { reason: Option<String> },
}

/// Channels for one opened link. Dropping `outbound` asks the connector to close.
pub struct RealtimeSession {
    pub outbound: mpsc::Sender<OutboundEvent>,
    pub signals: mpsc::Receiver<TransportSignal>,
}

/// The underlying realtime library: opens a link keyed by the user identity and
/// keeps it alive (including reconnects) until the outbound sender is dropped.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn open(&self, user_id: &str) -> Result<RealtimeSession>;
}

pub type EventHandler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

struct ActiveLink {
    user_id: String,
    outbound: mpsc::Sender<OutboundEvent>,
    pump: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct AdapterInner {
    connector: Arc<dyn RealtimeConnector>,
    handlers: Arc<DashMap<InboundEventKind, EventHandler>>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Mutex<Option<ActiveLink>>,
}

/// Cheaply cloneable handle to the single live connection of a session.
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("state", &self.state())
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

impl TransportAdapter {
    pub fn new(connector: Arc<dyn RealtimeConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(AdapterInner {
                connector,
                handlers: Arc::new(DashMap::new()),
                state: Arc::new(state),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Opens the connection for `user_id`.
    ///
    /// Calling this again for the user that already owns the link is a no-op.
    /// Connecting as another user closes the previous link first. Failures to
    /// reach the server are not returned here; they show up as state transitions
    /// and log records.
    pub async fn connect(&self, user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(TransportError::InvalidUserId);
        }

        let mut link = self.inner.link.lock().await;
        if let Some(active) = link.as_ref() {
            if active.user_id == user_id && !active.pump.is_finished() {
                tracing::debug!(
                    target: "threadline::realtime::connect",
                    "Already connected for user {}, skipping",
                    user_id
                );
                return Ok(());
            }
            tracing::debug!(
                target: "threadline::realtime::connect",
                "Closing previous link for user {}",
                active.user_id
            );
        }
        *link = None;

        self.inner.state.send_replace(ConnectionState::Connecting);

        match self.inner.connector.open(user_id).await {
            Ok(session) => {
                let pump = tokio::spawn(pump_signals(
                    user_id.to_string(),
                    session.outbound.clone(),
                    session.signals,
                    self.inner.handlers.clone(),
                    self.inner.state.clone(),
                ));
                *link = Some(ActiveLink {
                    user_id: user_id.to_string(),
                    outbound: session.outbound,
                    pump,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    target: "threadline::realtime::connect",
                    "Failed to open realtime link for user {}: {}",
                    user_id,
                    e
                );
                self.inner
                    .state
                    .send_replace(ConnectionState::Disconnected);
                Ok(())
            }
        }
    }

    /// Closes the connection. Safe to call when not connected.
    pub async fn disconnect(&self) {
        let previous = self.inner.link.lock().await.take();
        if let Some(active) = previous {
            tracing::debug!(
                target: "threadline::realtime::disconnect",
                "Disconnecting realtime link for user {}",
                active.user_id
            );
        }
        self.inner
            .state
            .send_replace(ConnectionState::Disconnected);
    }

    /// Emits a `send-message` event. Delivery is not guaranteed; callers rely on a
    /// later `message-sent` acknowledgment or on the HTTP fallback.
    pub async fn send(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let outbound = {
            let link = self.inner.link.lock().await;
            link.as_ref()
                .map(|active| active.outbound.clone())
                .ok_or(TransportError::NotConnected)?
        };

        outbound
            .send(OutboundEvent::SendMessage {
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
            })
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Registers the handler for `kind`, replacing any previous one.
    pub fn subscribe<F>(&self, kind: InboundEventKind, handler: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        if self
            .inner
            .handlers
            .insert(kind, Arc::new(handler))
            .is_some()
        {
            tracing::debug!(
                target: "threadline::realtime::subscribe",
                "Replaced existing handler for {}",
                kind
            );
        }
    }

    pub fn unsubscribe(&self, kind: InboundEventKind) {
        self.inner.handlers.remove(&kind);
    }

    pub fn has_handler(&self, kind: InboundEventKind) -> bool {
        self.inner.handlers.contains_key(&kind)
    }
}

/// Drains connector signals: tracks state, re-announces presence on every open
/// and hands inbound events to the registered handler.
async fn pump_signals(
    user_id: String,
    outbound: mpsc::Sender<OutboundEvent>,
    mut signals: mpsc::Receiver<TransportSignal>,
    handlers: Arc<DashMap<InboundEventKind, EventHandler>>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            TransportSignal::Open => {
                tracing::info!(
                    target: "threadline::realtime::pump_signals",
                    "Realtime link open for user {}",
                    user_id
                );
                state.send_replace(ConnectionState::Connected);
                let announce = OutboundEvent::UserOnline {
                    user_id: user_id.clone(),
                };
                if outbound.send(announce).await.is_err() {
                    tracing::warn!(
                        target: "threadline::realtime::pump_signals",
                        "Outbound channel closed before presence announcement"
                    );
                    break;
                }
            }
            TransportSignal::Event(event) => {
                let kind = event.kind();
                // Clone out of the map so the handler runs without holding the shard lock.
                let handler = handlers.get(&kind).map(|entry| entry.value().clone());
                match handler {
                    Some(handler) => handler(event),
                    None => tracing::debug!(
                        target: "threadline::realtime::pump_signals",
                        "No handler registered for {}, dropping event",
                        kind
                    ),
                }
            }
            TransportSignal::Dropped { reason } => {
                tracing::warn!(
                    target: "threadline::realtime::pump_signals",
                    "Realtime link dropped for user {}: {}",
                    user_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                state.send_replace(ConnectionState::Disconnected);
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
}
