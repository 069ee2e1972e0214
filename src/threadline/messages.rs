use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::SendMessageRequest;
use crate::realtime::ConnectionState;
use crate::threadline::error::{Result, ThreadlineError};
use crate::threadline::message_streaming::{ConversationUpdate, Notice, UpdateTrigger};
use crate::threadline::reconciliation::{DeliveryRoute, IngestOutcome, LocalEcho, StoreError};
use crate::threadline::{SessionState, Threadline};
use crate::types::{AttachmentRequest, Message};

/// How far an outgoing message got by the time `send_message` returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendReceipt {
    /// Handed to the live transport; confirmation arrives as an
    /// [`UpdateTrigger::EchoConfirmed`] update.
    Queued(LocalEcho),
    /// Created over HTTP; this is the server copy.
    Delivered(Message),
}

impl Threadline {
    /// Sends a message to `receiver_id`.
    ///
    /// A local echo is queued first. Plain text goes over the live transport
    /// when it is connected; attachments, and any send while disconnected, go
    /// over HTTP. A failed HTTP send leaves the echo marked as failed so it can
    /// be retried with [`Threadline::retry_message`].
    pub async fn send_message(
        &self,
        receiver_id: &str,
        content: &str,
        attachment: Option<AttachmentRequest>,
    ) -> Result<SendReceipt> {
        if receiver_id.trim().is_empty() {
            return Err(ThreadlineError::InvalidUserId);
        }
        if content.trim().is_empty() && attachment.is_none() {
            return Err(ThreadlineError::EmptyMessage);
        }

        let route = self.pick_route(attachment.as_ref());
        let (generation, user_id, echo) = self
            .with_session(|state| {
                let echo = state.outbox.push(receiver_id, content, attachment, route);
                self.streams.emit(
                    ConversationUpdate::new(UpdateTrigger::EchoQueued, receiver_id)
                        .with_echo(echo.clone()),
                );
                (state.generation, state.user.id.clone(), echo)
            })
            .await?;

        tracing::debug!(
            target: "threadline::messages::send_message",
            "Queued {} for {} via {:?}",
            echo.local_id,
            receiver_id,
            route
        );

        self.deliver(generation, &user_id, echo).await
    }

    /// Sends a failed message again. A message that is still pending is left
    /// alone and reported as queued.
    pub async fn retry_message(&self, local_id: &Uuid) -> Result<SendReceipt> {
        let (generation, user_id, echo, resend) = self
            .with_session(|state| -> Result<(u64, String, LocalEcho, bool)> {
                let echo = state
                    .outbox
                    .get(local_id)
                    .cloned()
                    .ok_or(ThreadlineError::EchoNotFound(*local_id))?;
                if echo.is_pending() {
                    return Ok((state.generation, state.user.id.clone(), echo, false));
                }

                let route = self.pick_route(echo.attachment.as_ref());
                let echo = state
                    .outbox
                    .mark_pending(local_id, route)
                    .ok_or(ThreadlineError::EchoNotFound(*local_id))?;
                self.streams.emit(
                    ConversationUpdate::new(UpdateTrigger::EchoQueued, &echo.receiver_id)
                        .with_echo(echo.clone()),
                );
                Ok((state.generation, state.user.id.clone(), echo, true))
            })
            .await??;

        if !resend {
            return Ok(SendReceipt::Queued(echo));
        }

        tracing::debug!(
            target: "threadline::messages::retry_message",
            "Retrying {} via {:?}",
            echo.local_id,
            echo.route
        );

        self.deliver(generation, &user_id, echo).await
    }

    fn pick_route(&self, attachment: Option<&AttachmentRequest>) -> DeliveryRoute {
        if attachment.is_none() && self.transport.state() == ConnectionState::Connected {
            DeliveryRoute::Socket
        } else {
            DeliveryRoute::Http
        }
    }

    async fn deliver(&self, generation: u64, user_id: &str, echo: LocalEcho) -> Result<SendReceipt> {
        let echo = if echo.route == DeliveryRoute::Socket {
            let sent = self
                .transport
                .send(user_id, &echo.receiver_id, &echo.content)
                .await;
            match sent {
                Ok(()) => return Ok(SendReceipt::Queued(echo)),
                Err(e) => {
                    tracing::warn!(
                        target: "threadline::messages::deliver",
                        "Live send of {} failed ({}), falling back to HTTP",
                        echo.local_id,
                        e
                    );
                    self.with_live_session(generation, |state| {
                        state.outbox.mark_pending(&echo.local_id, DeliveryRoute::Http)
                    })
                    .await
                    .flatten()
                    .unwrap_or(echo)
                }
            }
        } else {
            echo
        };

        let message = self.deliver_over_http(generation, user_id, echo).await?;
        Ok(SendReceipt::Delivered(message))
    }

    /// Creates the message of `echo` over HTTP. On success the server copy
    /// replaces the echo; on failure the echo is marked as failed.
    pub(crate) async fn deliver_over_http(
        &self,
        generation: u64,
        user_id: &str,
        echo: LocalEcho,
    ) -> Result<Message> {
        let request = SendMessageRequest::new(
            user_id,
            &echo.receiver_id,
            &echo.content,
            echo.attachment.as_ref(),
        );

        match self.fallback.post_message(&request).await {
            Ok(message) => {
                self.with_live_session(generation, |state| {
                    if let Err(e) = self.merge_confirmed(state, &message) {
                        tracing::warn!(
                            target: "threadline::messages::deliver_over_http",
                            "Server copy of {} was not merged: {}",
                            echo.local_id,
                            e
                        );
                    }
                    if let Some(confirmed) = state.outbox.remove(&echo.local_id) {
                        self.streams.emit(
                            ConversationUpdate::new(
                                UpdateTrigger::EchoConfirmed,
                                &confirmed.receiver_id,
                            )
                            .with_message(message.clone())
                            .with_echo(confirmed),
                        );
                    }
                })
                .await;
                Ok(message)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(
                    target: "threadline::messages::deliver_over_http",
                    "Failed to send {} to {}: {}",
                    echo.local_id,
                    echo.receiver_id,
                    reason
                );
                self.with_live_session(generation, |state| {
                    if let Some(failed) = state.outbox.mark_failed(&echo.local_id, reason.clone()) {
                        self.streams.emit(
                            ConversationUpdate::new(UpdateTrigger::EchoFailed, &failed.receiver_id)
                                .with_echo(failed.clone()),
                        );
                        self.streams.notify(Notice::DeliveryFailed {
                            local_id: failed.local_id,
                            peer_id: failed.receiver_id,
                            reason,
                        });
                    }
                })
                .await;
                Err(e.into())
            }
        }
    }

    /// Merges a server-confirmed message into the session store and announces
    /// it. A duplicate is absorbed silently.
    pub(super) fn merge_confirmed(
        &self,
        state: &mut SessionState,
        message: &Message,
    ) -> std::result::Result<IngestOutcome, StoreError> {
        let outcome = state.store.ingest_live_message(message.clone())?;
        if let IngestOutcome::Inserted {
            peer_id,
            discovered_peer,
        } = &outcome
        {
            if *discovered_peer {
                self.streams
                    .emit(ConversationUpdate::new(UpdateTrigger::PeerDiscovered, peer_id));
            }
            self.streams.emit(
                ConversationUpdate::new(UpdateTrigger::NewMessage, peer_id)
                    .with_message(message.clone()),
            );
        }
        Ok(outcome)
    }
}
