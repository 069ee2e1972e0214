use crate::threadline::Threadline;
use crate::threadline::error::{Result, ThreadlineError};
use crate::threadline::message_streaming::{
    ConversationSubscription, ConversationUpdate, Notice, UpdateTrigger,
};
use crate::threadline::projector::{ConversationProjector, ConversationSummary, ThreadView};

impl Threadline {
    /// Fetches the peer list again and merges it into the session.
    ///
    /// Returns the unfiltered conversation list.
    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let (generation, user_id) = self
            .with_session(|state| (state.generation, state.user.id.clone()))
            .await?;

        let peers = match self.history.get_conversation_peers(&user_id).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!(
                    target: "threadline::conversations::refresh_conversations",
                    "Failed to load conversation peers for {}: {}",
                    user_id,
                    e
                );
                self.streams.notify(Notice::FetchFailed {
                    operation: "conversation peers".to_string(),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.with_live_session(generation, |state| {
            for peer_id in state.store.register_peers(peers) {
                self.streams
                    .emit(ConversationUpdate::new(UpdateTrigger::PeerDiscovered, peer_id));
            }
            ConversationProjector::list_conversations(&state.store, "")
        })
        .await
        .ok_or(ThreadlineError::NoActiveSession)
    }

    /// Conversations whose peer name starts with `filter_text`, ignoring case.
    pub async fn list_conversations(&self, filter_text: &str) -> Result<Vec<ConversationSummary>> {
        self.with_session(|state| ConversationProjector::list_conversations(&state.store, filter_text))
            .await
    }

    pub async fn select_conversation(&self, peer_id: &str) -> Result<()> {
        self.with_session(|state| state.projector.select_conversation(peer_id))
            .await
    }

    pub async fn close_conversation(&self) -> Result<()> {
        self.with_session(|state| state.projector.clear_selection())
            .await
    }

    /// Thread of the selected conversation, or None if nothing is selected.
    pub async fn current_thread(&self) -> Result<Option<ThreadView>> {
        self.with_session(|state| state.projector.current_thread(&state.store, &state.outbox))
            .await
    }

    /// Selects `peer_id` and reloads its full history from the server.
    ///
    /// The reload replaces what the session held for that conversation when the
    /// fetch was issued. Live messages merged while the fetch was in flight are
    /// kept. A load that completes after the user navigated elsewhere still
    /// merges, unless the session itself was replaced.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<ThreadView> {
        let (generation, user_id, held_at_issue) = self
            .with_session(|state| {
                state.projector.select_conversation(peer_id);
                (
                    state.generation,
                    state.user.id.clone(),
                    state.store.conversation_ids(peer_id),
                )
            })
            .await?;

        let history = match self.history.get_history(&user_id, peer_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(
                    target: "threadline::conversations::open_conversation",
                    "Failed to load history with {}: {}",
                    peer_id,
                    e
                );
                self.streams.notify(Notice::FetchFailed {
                    operation: format!("history with {}", peer_id),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.with_live_session(generation, |state| {
            let report = state
                .store
                .replace_history(peer_id, history, &held_at_issue);
            if report.discovered_peer {
                self.streams
                    .emit(ConversationUpdate::new(UpdateTrigger::PeerDiscovered, peer_id));
            }
            self.streams
                .emit(ConversationUpdate::new(UpdateTrigger::HistoryLoaded, peer_id));
            ThreadView::build(&state.store, &state.outbox, peer_id)
        })
        .await
        .ok_or(ThreadlineError::NoActiveSession)
    }

    /// Snapshot of one conversation plus a receiver for everything that
    /// happens to it afterwards.
    pub async fn subscribe_to_conversation(&self, peer_id: &str) -> Result<ConversationSubscription> {
        self.with_session(|state| ConversationSubscription {
            initial_messages: state.store.conversation_messages(peer_id),
            pending_echoes: state.outbox.for_peer(peer_id),
            updates: self.streams.subscribe(peer_id),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_utils::MockBackend;
    use crate::api::{self, HistoryFetcher};
    use crate::realtime::{InboundEvent, TransportSignal};
    use crate::threadline::test_utils::*;
    use crate::types::{LocalUser, Message, PeerSummary};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// History source whose `get_history` waits until released.
    struct GatedHistory {
        backend: Arc<MockBackend>,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HistoryFetcher for GatedHistory {
        async fn get_conversation_peers(&self, user_id: &str) -> api::Result<Vec<PeerSummary>> {
            self.backend.get_conversation_peers(user_id).await
        }

        async fn get_history(&self, user_id: &str, peer_id: &str) -> api::Result<Vec<Message>> {
            self.started.notify_one();
            self.release.notified().await;
            self.backend.get_history(user_id, peer_id).await
        }
    }

    #[tokio::test]
    async fn test_list_conversations_filters_by_name_prefix() {
        let session = create_mock_threadline();
        session.backend.set_peers(vec![
            PeerSummary::new("peer1", "Ada"),
            PeerSummary::new("peer2", "adam"),
            PeerSummary::new("peer3", "Grace"),
        ]);
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();

        let listed = session.threadline.list_conversations("AD").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.peer.id.as_str()).collect();
        assert_eq!(ids, vec!["peer1", "peer2"]);

        assert!(
            session
                .threadline
                .list_conversations("zed")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_refresh_announces_only_new_peers() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();
        let mut updates = session.threadline.subscribe_to_conversation_list();

        session.backend.set_peers(vec![
            PeerSummary::new("peer1", "Ada"),
            PeerSummary::new("peer2", "Grace"),
        ]);
        let listed = session.threadline.refresh_conversations().await.unwrap();

        assert_eq!(listed.len(), 2);
        let update = next_update(&mut updates).await;
        assert_eq!(update.trigger, UpdateTrigger::PeerDiscovered);
        assert_eq!(update.peer_id, "peer2");
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();
        let mut notices = session.threadline.subscribe_to_notices();

        session.backend.clear_peers();
        let result = session.threadline.refresh_conversations().await;

        assert!(matches!(result, Err(ThreadlineError::Fetch(_))));
        assert!(matches!(
            next_notice(&mut notices).await,
            Notice::FetchFailed { ref operation, .. } if operation == "conversation peers"
        ));
        // What was loaded before stays available.
        assert_eq!(session.threadline.list_conversations("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_conversation_loads_and_replaces_history() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        let link = login_connected(&session).await;

        let mut updates = session.threadline.subscribe_to_conversation_list();

        // A message that the server no longer has.
        link.signals
            .send(TransportSignal::Event(InboundEvent::NewMessage {
                message: message_at("gone", "peer1", LOCAL_USER, "deleted", 1),
            }))
            .await
            .unwrap();
        assert_eq!(next_update(&mut updates).await.trigger, UpdateTrigger::NewMessage);

        session.backend.set_history(
            "peer1",
            vec![
                message_at("a", "peer1", LOCAL_USER, "first", 2),
                message_at("b", LOCAL_USER, "peer1", "second", 3),
            ],
        );

        let thread = session.threadline.open_conversation("peer1").await.unwrap();

        let ids: Vec<&str> = thread.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(thread.peer.name, "Ada");
        assert_eq!(
            next_update(&mut updates).await.trigger,
            UpdateTrigger::HistoryLoaded
        );

        let current = session.threadline.current_thread().await.unwrap().unwrap();
        assert_eq!(current, thread);
        assert_eq!(session.backend.history_calls(), 1);
    }

    #[tokio::test]
    async fn test_open_conversation_keeps_messages_arriving_mid_fetch() {
        let backend = Arc::new(MockBackend::new());
        let gated = Arc::new(GatedHistory {
            backend: backend.clone(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let session = create_threadline_with_history(gated.clone(), backend.clone());
        backend.set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        let link = login_connected(&session).await;
        let mut updates = session.threadline.subscribe_to_conversation_list();

        // Held before the fetch and missing from the server copy.
        link.signals
            .send(TransportSignal::Event(InboundEvent::NewMessage {
                message: message_at("gone", "peer1", LOCAL_USER, "deleted", 1),
            }))
            .await
            .unwrap();
        assert_eq!(next_update(&mut updates).await.trigger, UpdateTrigger::NewMessage);

        backend.set_history("peer1", vec![message_at("m1", "peer1", LOCAL_USER, "old", 2)]);

        let threadline = session.threadline.clone();
        let open = tokio::spawn(async move { threadline.open_conversation("peer1").await });
        gated.started.notified().await;

        // Newer than the snapshot the server is about to return.
        link.signals
            .send(TransportSignal::Event(InboundEvent::NewMessage {
                message: message_at("m2", LOCAL_USER, "peer1", "new", 3),
            }))
            .await
            .unwrap();
        let update = next_update(&mut updates).await;
        assert_eq!(update.trigger, UpdateTrigger::NewMessage);
        assert_eq!(update.message.unwrap().id, "m2");

        gated.release.notify_one();
        let thread = open.await.unwrap().unwrap();

        let ids: Vec<&str> = thread.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_open_conversation_failure_keeps_selection() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();
        let mut notices = session.threadline.subscribe_to_notices();

        let result = session.threadline.open_conversation("peer1").await;

        assert!(matches!(result, Err(ThreadlineError::Fetch(_))));
        assert!(matches!(
            next_notice(&mut notices).await,
            Notice::FetchFailed { .. }
        ));
        let thread = session.threadline.current_thread().await.unwrap().unwrap();
        assert_eq!(thread.peer.id, "peer1");
        assert!(thread.messages.is_empty());
    }

    #[tokio::test]
    async fn test_close_conversation_clears_thread() {
        let session = create_mock_threadline();
        session.backend.set_peers(Vec::new());
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();

        session.threadline.select_conversation("peer1").await.unwrap();
        assert!(session.threadline.current_thread().await.unwrap().is_some());

        session.threadline.close_conversation().await.unwrap();
        assert!(session.threadline.current_thread().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_snapshot_then_updates() {
        let session = create_mock_threadline();
        session
            .backend
            .set_peers(vec![PeerSummary::new("peer1", "Ada")]);
        session
            .backend
            .set_history("peer1", vec![message_at("a", "peer1", LOCAL_USER, "first", 1)]);
        let link = login_connected(&session).await;
        session.threadline.open_conversation("peer1").await.unwrap();

        let mut subscription = session
            .threadline
            .subscribe_to_conversation("peer1")
            .await
            .unwrap();
        assert_eq!(subscription.initial_messages.len(), 1);
        assert!(subscription.pending_echoes.is_empty());

        link.signals
            .send(TransportSignal::Event(InboundEvent::NewMessage {
                message: message_at("b", "peer1", LOCAL_USER, "second", 2),
            }))
            .await
            .unwrap();
        // Traffic for another peer does not reach this subscription.
        link.signals
            .send(TransportSignal::Event(InboundEvent::NewMessage {
                message: message_at("x", "peer2", LOCAL_USER, "elsewhere", 3),
            }))
            .await
            .unwrap();

        let update = next_update(&mut subscription.updates).await;
        assert_eq!(update.trigger, UpdateTrigger::NewMessage);
        assert_eq!(update.message.unwrap().id, "b");

        // Once peer2's message is in, nothing else arrived for peer1.
        let mut attempts = 0;
        while session.threadline.list_conversations("").await.unwrap().len() < 2 {
            attempts += 1;
            assert!(attempts < 100, "message for peer2 never arrived");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(subscription.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_logout_closes_conversation_streams() {
        let session = create_mock_threadline();
        session.backend.set_peers(Vec::new());
        session
            .threadline
            .login(LocalUser::new(LOCAL_USER, "Me"))
            .await
            .unwrap();
        let mut subscription = session
            .threadline
            .subscribe_to_conversation("peer1")
            .await
            .unwrap();

        session.threadline.logout().await;

        assert!(matches!(
            subscription.updates.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }
}
