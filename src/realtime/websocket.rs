//! WebSocket implementation of [`RealtimeConnector`].
//!
//! The connection is keyed by the user through a `userId` query parameter. When
//! the socket drops, the connector waits `reconnect_delay` and dials again until
//! the adapter drops its outbound sender.
//!
//! Framing is this crate's own: every event is one JSON text frame of the form
//! `{"event": "<name>", "data": {...}}` over a plain WebSocket. It does not speak
//! the Socket.IO or Engine.IO protocols and cannot talk to a Socket.IO server
//! without a bridge that translates these frames.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{
    InboundEvent, OutboundEvent, RealtimeConnector, RealtimeSession, Result, TransportError,
    TransportSignal,
};

const OUTBOUND_BUFFER: usize = 64;
const SIGNAL_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    reconnect_delay: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
        }
    }

    fn url_for(&self, user_id: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| TransportError::Connection(format!("Invalid socket url: {}", e)))?;
        url.query_pairs_mut().append_pair("userId", user_id);
        Ok(url.to_string())
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn open(&self, user_id: &str) -> Result<RealtimeSession> {
        let url = self.url_for(user_id)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        tokio::spawn(run_connection(
            url,
            self.reconnect_delay,
            outbound_rx,
            signal_tx,
        ));

        Ok(RealtimeSession {
            outbound: outbound_tx,
            signals: signal_rx,
        })
    }
}

enum LinkEnd {
    /// The adapter went away; stop for good.
    Closed,
    /// The socket failed; dial again after the delay.
    Dropped(String),
}

async fn run_connection(
    url: String,
    reconnect_delay: Duration,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    signals: mpsc::Sender<TransportSignal>,
) {
    loop {
        let reason = match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                tracing::debug!(
                    target: "threadline::realtime::websocket",
                    "WebSocket connected to {}",
                    url
                );
                if signals.send(TransportSignal::Open).await.is_err() {
                    return;
                }
                match drive_socket(stream, &mut outbound, &signals).await {
                    LinkEnd::Closed => return,
                    LinkEnd::Dropped(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        if signals
            .send(TransportSignal::Dropped {
                reason: Some(reason),
            })
            .await
            .is_err()
        {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = signals.closed() => return,
            None = outbound.recv() => return,
        }
    }
}

async fn drive_socket<S>(
    stream: S,
    outbound: &mut mpsc::Receiver<OutboundEvent>,
    signals: &mpsc::Sender<TransportSignal>,
) -> LinkEnd
where
    S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = write.close().await;
                    return LinkEnd::Closed;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(
                            target: "threadline::realtime::websocket",
                            "Failed to encode outbound frame: {}",
                            e
                        );
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    return LinkEnd::Dropped(e.to_string());
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => {
                                if signals.send(TransportSignal::Event(event)).await.is_err() {
                                    return LinkEnd::Closed;
                                }
                            }
                            Err(e) => tracing::debug!(
                                target: "threadline::realtime::websocket",
                                "Ignoring unrecognized frame: {}",
                                e
                            ),
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(e) = write.send(WsMessage::Pong(payload)).await {
                            return LinkEnd::Dropped(e.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return LinkEnd::Dropped("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                }
            }
        }
    }
}
