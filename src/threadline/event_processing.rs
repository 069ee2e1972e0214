use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver};

use crate::realtime::{InboundEvent, InboundEventKind};
use crate::threadline::error::Result;
use crate::threadline::message_streaming::{ConversationUpdate, Notice, UpdateTrigger};
use crate::threadline::reconciliation::DeliveryRoute;
use crate::threadline::{EventWorker, Threadline, live_session};
use crate::types::Message;

const INBOUND_EVENTS: [InboundEventKind; 3] = [
    InboundEventKind::NewMessage,
    InboundEventKind::MessageSent,
    InboundEventKind::MessageError,
];

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

impl Threadline {
    // ============================================================================
    // EVENT PROCESSING
    // ============================================================================

    /// Routes the transport handlers into an ordered queue and starts the loop
    /// that applies them to the session identified by `generation`.
    ///
    /// The queue is unbounded: handlers run synchronously on the transport pump
    /// and every event must reach the loop, even while it waits on the session.
    pub(crate) async fn start_event_processing(&self, generation: u64) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        for kind in INBOUND_EVENTS {
            let sender = event_sender.clone();
            self.transport.subscribe(kind, move |event| {
                // Only fails once the loop has stopped
                if sender.send(event).is_err() {
                    tracing::debug!(
                        target: "threadline::process_events",
                        "Event processing stopped, ignoring inbound {} event",
                        kind
                    );
                }
            });
        }
        drop(event_sender);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.process_events(generation, event_receiver, shutdown_receiver)
                .await;
        });

        *self.worker.lock().await = Some(EventWorker {
            shutdown_sender,
            handle,
        });
    }

    /// Stops the loop after it drains what is already queued.
    pub(crate) async fn shutdown_event_processing(&self) {
        for kind in INBOUND_EVENTS {
            self.transport.unsubscribe(kind);
        }

        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };

        // Fails if the loop already exited
        let _ = worker.shutdown_sender.send(()).await;
        drop(worker.shutdown_sender);

        let mut handle = worker.handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(
                target: "threadline::process_events",
                "Event processing did not stop in time, aborting"
            );
            handle.abort();
        }
    }

    /// Main event processing loop
    async fn process_events(
        &self,
        generation: u64,
        mut receiver: UnboundedReceiver<InboundEvent>,
        mut shutdown: Receiver<()>,
    ) {
        tracing::debug!(
            target: "threadline::process_events",
            "Starting event processing loop for session {}",
            generation
        );

        let mut shutting_down = false;

        loop {
            tokio::select! {
                Some(event) = receiver.recv() => {
                    let kind = event.kind();
                    if let Err(e) = self.handle_inbound_event(generation, event).await {
                        tracing::warn!(
                            target: "threadline::process_events",
                            "Failed to process {} event: {}",
                            kind,
                            e
                        );
                    }
                }
                Some(_) = shutdown.recv(), if !shutting_down => {
                    tracing::info!(
                        target: "threadline::process_events",
                        "Received shutdown signal, finishing current queue..."
                    );
                    shutting_down = true;
                }
                else => {
                    tracing::debug!(
                        target: "threadline::process_events",
                        "Queue flushed, event processing for session {} stopped",
                        generation
                    );
                    break;
                }
            }
        }
    }

    async fn handle_inbound_event(&self, generation: u64, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::NewMessage { message } => {
                self.apply_pushed_message(generation, message, false).await
            }
            InboundEvent::MessageSent {
                success: true,
                message: Some(message),
            } => self.apply_pushed_message(generation, message, true).await,
            InboundEvent::MessageSent {
                success: true,
                message: None,
            } => {
                tracing::warn!(
                    target: "threadline::process_events",
                    "Acknowledgment without a message, nothing to confirm"
                );
                Ok(())
            }
            InboundEvent::MessageSent { success: false, .. } => {
                self.recover_socket_send(generation, "server reported the message as not sent")
                    .await
            }
            InboundEvent::MessageError { error } => {
                let reason = error.unwrap_or_else(|| "unknown transport error".to_string());
                self.streams.notify(Notice::TransportError {
                    reason: reason.clone(),
                });
                self.recover_socket_send(generation, &reason).await
            }
        }
    }

    /// Merges a message the server pushed. When `acknowledged` is set the
    /// message is the server copy of one of our socket sends, and the matching
    /// local echo is retired.
    async fn apply_pushed_message(
        &self,
        generation: u64,
        message: Message,
        acknowledged: bool,
    ) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(state) = live_session(&mut slot, generation) else {
            return Ok(());
        };

        let outcome = self.merge_confirmed(state, &message)?;

        if acknowledged
            && message.sender_id == state.user.id
            && let Some(echo) = state.outbox.confirm_socket_echo(&message)
        {
            tracing::debug!(
                target: "threadline::process_events",
                "Socket send {} confirmed as {}",
                echo.local_id,
                message.id
            );
            self.streams.emit(
                ConversationUpdate::new(UpdateTrigger::EchoConfirmed, outcome.peer_id())
                    .with_message(message)
                    .with_echo(echo),
            );
        }

        Ok(())
    }

    /// The server refused a socket send. The oldest pending socket echo is
    /// re-sent over HTTP.
    async fn recover_socket_send(&self, generation: u64, reason: &str) -> Result<()> {
        let pending = {
            let mut slot = self.session.lock().await;
            let Some(state) = live_session(&mut slot, generation) else {
                return Ok(());
            };
            let local_id = state.outbox.oldest_pending_socket().map(|echo| echo.local_id);
            local_id
                .and_then(|local_id| state.outbox.mark_pending(&local_id, DeliveryRoute::Http))
                .map(|echo| (state.user.id.clone(), echo))
        };

        let Some((user_id, echo)) = pending else {
            tracing::debug!(
                target: "threadline::process_events",
                "Socket send failure ({}) with no pending socket message",
                reason
            );
            return Ok(());
        };

        tracing::warn!(
            target: "threadline::process_events",
            "Socket send failed ({}), retrying {} over HTTP",
            reason,
            echo.local_id
        );
        self.deliver_over_http(generation, &user_id, echo).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::realtime::{InboundEvent, OutboundEvent, TransportSignal};
    use crate::threadline::message_streaming::{Notice, UpdateTrigger};
    use crate::threadline::messages::SendReceipt;
    use crate::threadline::reconciliation::EchoStatus;
    use crate::threadline::test_utils::*;
    use crate::types::PeerSummary;

    async fn push(link: &crate::realtime::test_utils::MockLink, event: InboundEvent) {
        link.signals
            .send(TransportSignal::Event(event))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_message_is_ingested_once() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        let link = login_connected(&session).await;
        let mut updates = session.threadline.subscribe_to_conversation_list();

        let message = message_at("m1", "peer1", LOCAL_USER, "hi", 1);
        push(&link, InboundEvent::NewMessage { message: message.clone() }).await;
        push(&link, InboundEvent::NewMessage { message: message.clone() }).await;
        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("m2", "peer1", LOCAL_USER, "again", 2),
            },
        )
        .await;

        let first = next_update(&mut updates).await;
        assert_eq!(first.trigger, UpdateTrigger::NewMessage);
        assert_eq!(first.message.unwrap().id, "m1");
        // The duplicate produced no update; the next one is m2.
        let second = next_update(&mut updates).await;
        assert_eq!(second.message.unwrap().id, "m2");

        let listed = session.threadline.list_conversations("").await.unwrap();
        assert_eq!(listed[0].last_message_summary, "again");
    }

    #[tokio::test]
    async fn test_burst_while_session_busy_is_not_dropped() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        let link = login_connected(&session).await;

        // Keep the loop waiting on the session while the burst is forwarded.
        let guard = session.threadline.session.lock().await;
        for i in 0..5 {
            push(
                &link,
                InboundEvent::NewMessage {
                    message: message_at(&format!("burst-{}", i), "peer1", LOCAL_USER, "hi", i),
                },
            )
            .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(guard);

        session.threadline.select_conversation("peer1").await.unwrap();
        let mut attempts = 0;
        loop {
            let thread = session.threadline.current_thread().await.unwrap().unwrap();
            if thread.messages.len() == 5 {
                break;
            }
            attempts += 1;
            assert!(attempts < 100, "held {} of 5 messages", thread.messages.len());
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_message_from_unknown_peer_extends_list() {
        let session = create_mock_threadline();
        session.backend.set_peers(Vec::new());
        let link = login_connected(&session).await;
        let mut updates = session.threadline.subscribe_to_conversation_list();

        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("c", "peer2", LOCAL_USER, "hi", 3),
            },
        )
        .await;

        let discovered = next_update(&mut updates).await;
        assert_eq!(discovered.trigger, UpdateTrigger::PeerDiscovered);
        assert_eq!(discovered.peer_id, "peer2");

        let listed = session.threadline.list_conversations("").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].peer.id, "peer2");
        assert_eq!(listed[0].last_message_summary, "hi");
    }

    #[tokio::test]
    async fn test_foreign_message_is_dropped() {
        let session = create_mock_threadline();
        session.backend.set_peers(Vec::new());
        let link = login_connected(&session).await;
        let mut updates = session.threadline.subscribe_to_conversation_list();

        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("x", "peer1", "peer2", "not ours", 1),
            },
        )
        .await;
        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("y", "peer3", LOCAL_USER, "ours", 2),
            },
        )
        .await;

        // Only the second message produces updates.
        let update = next_update(&mut updates).await;
        assert_eq!(update.peer_id, "peer3");
        let listed = session.threadline.list_conversations("").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_message_sent_confirms_socket_echo() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        let mut link = login_connected(&session).await;
        let mut updates = session.threadline.subscribe_to_conversation_list();

        let receipt = session
            .threadline
            .send_message("peer1", "hello", None)
            .await
            .unwrap();
        let SendReceipt::Queued(echo) = receipt else {
            panic!("expected the socket path");
        };
        assert_eq!(
            link.outbound.recv().await.unwrap(),
            OutboundEvent::SendMessage {
                sender_id: LOCAL_USER.to_string(),
                receiver_id: "peer1".to_string(),
                content: "hello".to_string(),
            }
        );
        assert_eq!(next_update(&mut updates).await.trigger, UpdateTrigger::EchoQueued);

        push(
            &link,
            InboundEvent::MessageSent {
                success: true,
                message: Some(message_at("srv-1", LOCAL_USER, "peer1", "hello", 5)),
            },
        )
        .await;

        assert_eq!(next_update(&mut updates).await.trigger, UpdateTrigger::NewMessage);
        let confirmed = next_update(&mut updates).await;
        assert_eq!(confirmed.trigger, UpdateTrigger::EchoConfirmed);
        assert_eq!(confirmed.echo.unwrap().local_id, echo.local_id);

        session.threadline.select_conversation("peer1").await.unwrap();
        let thread = session.threadline.current_thread().await.unwrap().unwrap();
        assert_eq!(thread.messages.len(), 1);
        assert!(thread.echoes.is_empty());
    }

    #[tokio::test]
    async fn test_message_error_falls_back_to_http() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session
            .backend
            .push_confirmation(message_at("srv-9", LOCAL_USER, "peer1", "hello", 5));
        let mut link = login_connected(&session).await;
        let mut notices = session.threadline.subscribe_to_notices();
        let mut updates = session.threadline.subscribe_to_conversation_list();

        session
            .threadline
            .send_message("peer1", "hello", None)
            .await
            .unwrap();
        link.outbound.recv().await.unwrap();

        push(
            &link,
            InboundEvent::MessageError {
                error: Some("receiver offline".to_string()),
            },
        )
        .await;

        assert_eq!(
            next_notice(&mut notices).await,
            Notice::TransportError {
                reason: "receiver offline".to_string()
            }
        );

        loop {
            let update = next_update(&mut updates).await;
            if update.trigger == UpdateTrigger::EchoConfirmed {
                assert_eq!(update.message.unwrap().id, "srv-9");
                break;
            }
        }

        let posted = session.backend.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].content, "hello");

        session.threadline.select_conversation("peer1").await.unwrap();
        let thread = session.threadline.current_thread().await.unwrap().unwrap();
        assert_eq!(thread.messages[0].id, "srv-9");
        assert!(thread.echoes.is_empty());

        // The socket push of the same message later is absorbed.
        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("srv-9", LOCAL_USER, "peer1", "hello", 5),
            },
        )
        .await;
        push(
            &link,
            InboundEvent::NewMessage {
                message: message_at("m-next", "peer1", LOCAL_USER, "thanks", 6),
            },
        )
        .await;
        let next = next_update(&mut updates).await;
        assert_eq!(next.message.unwrap().id, "m-next");
    }

    #[tokio::test]
    async fn test_failed_fallback_marks_echo_failed() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session.backend.set_fail_posts(true);
        let mut link = login_connected(&session).await;
        let mut notices = session.threadline.subscribe_to_notices();

        session
            .threadline
            .send_message("peer1", "hello", None)
            .await
            .unwrap();
        link.outbound.recv().await.unwrap();

        push(
            &link,
            InboundEvent::MessageSent {
                success: false,
                message: None,
            },
        )
        .await;

        let notice = next_notice(&mut notices).await;
        assert!(matches!(notice, Notice::DeliveryFailed { ref peer_id, .. } if peer_id == "peer1"));

        session.threadline.select_conversation("peer1").await.unwrap();
        let thread = session.threadline.current_thread().await.unwrap().unwrap();
        assert!(thread.messages.is_empty());
        assert_eq!(thread.echoes.len(), 1);
        assert!(matches!(thread.echoes[0].status, EchoStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_message_error_without_pending_send_only_notifies() {
        let session = create_mock_threadline();
        session.backend.set_peers(Vec::new());
        let link = login_connected(&session).await;
        let mut notices = session.threadline.subscribe_to_notices();

        push(&link, InboundEvent::MessageError { error: None }).await;

        assert_eq!(
            next_notice(&mut notices).await,
            Notice::TransportError {
                reason: "unknown transport error".to_string()
            }
        );
        assert!(session.backend.posted().is_empty());
    }
}
