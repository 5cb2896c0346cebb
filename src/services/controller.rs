//! Operator and participant actions. Mode changes are persisted before they are
//! published; chat and votes are only stored once the broker has accepted them.

use crate::error::{AppError, AppResult};
use crate::models::demo::{DemoMode, DemoSnapshot, DemoStateUpdate};
use crate::models::message::{
    now_millis, ChatMessage, ControlAction, ControlMessage, VoteMessage, VoteOption,
};
use crate::models::topic::{topic_for, TopicKind};
use crate::repositories::DemoStore;
use crate::services::connection::ConnectionManager;
use crate::services::demo::{self, ModeView};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use validator::Validate;

/// Drives the demo for one application stage. Cheap to clone.
#[derive(Clone)]
pub struct DemoController {
    manager: ConnectionManager,
    store: Arc<dyn DemoStore>,
    app_name: String,
    stage: String,
    /// Held for the whole of a trigger, so mode changes apply one at a time.
    view: Arc<Mutex<ModeView>>,
}

impl DemoController {
    /// Controller whose confirmed mode starts from the persisted snapshot.
    pub async fn new(manager: ConnectionManager, store: Arc<dyn DemoStore>) -> Self {
        let mode = demo::bootstrap(store.as_ref()).await;
        let config = manager.config();
        let (app_name, stage) = (config.app_name.clone(), config.stage.clone());
        Self {
            manager,
            store,
            app_name,
            stage,
            view: Arc::new(Mutex::new(ModeView::new(mode))),
        }
    }

    pub async fn mode(&self) -> DemoMode {
        self.view.lock().await.current()
    }

    /// Move every audience to the mode `action` selects. On failure nothing is confirmed.
    #[instrument(skip(self))]
    pub async fn trigger(&self, action: ControlAction) -> AppResult<DemoMode> {
        let mode = action
            .target_mode()
            .ok_or_else(|| AppError::Validation("unknown control action".to_string()))?;

        let mut view = self.view.lock().await;
        view.propose(mode);
        match self.commit(action, mode).await {
            Ok(()) => {
                let confirmed = view.confirm();
                info!(mode = %confirmed, "demo mode changed");
                Ok(confirmed)
            }
            Err(e) => {
                let kept = view.rollback();
                warn!(error = %e, mode = %kept, "mode change rolled back");
                Err(e)
            }
        }
    }

    async fn commit(&self, action: ControlAction, mode: DemoMode) -> AppResult<()> {
        let previous = self.store.get_state().await?;
        if action == ControlAction::Reset {
            self.store.reset_state().await?;
        } else {
            self.store.upsert_state(&DemoStateUpdate::for_mode(mode)).await?;
        }

        let topic = topic_for(TopicKind::Control, &self.app_name, &self.stage);
        if let Err(e) = self.manager.publish(&topic, &ControlMessage::new(action)).await {
            self.restore(previous).await;
            return Err(e);
        }

        // History goes only once the audience has been told to reset.
        if action == ControlAction::Reset {
            self.clear_history().await;
        }
        Ok(())
    }

    /// The audience has already moved on, so a failure here cannot undo the reset.
    async fn clear_history(&self) {
        if let Err(e) = self.store.clear_chat().await {
            warn!(error = %e, "could not clear chat history after reset");
        }
        if let Err(e) = self.store.clear_votes().await {
            warn!(error = %e, "could not clear votes after reset");
        }
    }

    /// Put the snapshot back the way it was before a failed trigger.
    async fn restore(&self, previous: Option<DemoSnapshot>) {
        let restored = match previous {
            Some(snapshot) => {
                let update = DemoStateUpdate {
                    mode: Some(snapshot.mode),
                    chat_enabled: Some(snapshot.chat_enabled),
                    vote_enabled: Some(snapshot.vote_enabled),
                };
                self.store.upsert_state(&update).await
            }
            None => self.store.reset_state().await,
        };
        if let Err(e) = restored {
            warn!(error = %e, "could not restore demo snapshot");
        }
    }

    /// Validate and publish a chat message, then add it to the history.
    /// A denied publish stores nothing.
    #[instrument(skip(self, text))]
    pub async fn send_chat(&self, username: &str, text: &str) -> AppResult<ChatMessage> {
        let message = ChatMessage::new(username.trim(), text.trim());
        message
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let topic = topic_for(TopicKind::Chat, &self.app_name, &self.stage);
        self.manager.publish(&topic, &message).await?;
        self.store.append_chat(&message).await.map_err(|e| {
            warn!(error = %e, id = %message.id, "chat published but not stored");
            e
        })?;
        Ok(message)
    }

    /// Publish a vote, then record it. A user's new vote replaces the old one.
    #[instrument(skip(self))]
    pub async fn cast_vote(&self, user_id: &str, option: VoteOption) -> AppResult<VoteMessage> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::Validation("userId is required".to_string()));
        }
        let vote = VoteMessage {
            option,
            user_id: user_id.to_string(),
            timestamp: now_millis(),
        };

        let topic = topic_for(TopicKind::Vote, &self.app_name, &self.stage);
        self.manager.publish(&topic, &vote).await?;
        self.store.upsert_vote(&vote).await.map_err(|e| {
            warn!(error = %e, user_id = %vote.user_id, "vote published but not stored");
            e
        })?;
        Ok(vote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support;
    use crate::config::RealtimeConfig;
    use crate::repositories::MemoryDemoStore;
    use crate::services::authorizer::TopicAuthorizer;
    use crate::transport::{MemoryBroker, WireOp};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose vote clearing can be made to fail while everything else works.
    #[derive(Clone, Default)]
    struct FlakyClearStore {
        inner: MemoryDemoStore,
        fail_clear_votes: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DemoStore for FlakyClearStore {
        async fn get_state(&self) -> AppResult<Option<DemoSnapshot>> {
            self.inner.get_state().await
        }
        async fn upsert_state(&self, update: &DemoStateUpdate) -> AppResult<DemoSnapshot> {
            self.inner.upsert_state(update).await
        }
        async fn reset_state(&self) -> AppResult<DemoSnapshot> {
            self.inner.reset_state().await
        }
        async fn append_chat(&self, message: &ChatMessage) -> AppResult<()> {
            self.inner.append_chat(message).await
        }
        async fn list_chat(&self, limit: usize) -> AppResult<Vec<ChatMessage>> {
            self.inner.list_chat(limit).await
        }
        async fn clear_chat(&self) -> AppResult<()> {
            self.inner.clear_chat().await
        }
        async fn upsert_vote(&self, vote: &VoteMessage) -> AppResult<()> {
            self.inner.upsert_vote(vote).await
        }
        async fn list_votes(&self) -> AppResult<Vec<VoteMessage>> {
            self.inner.list_votes().await
        }
        async fn clear_votes(&self) -> AppResult<()> {
            if self.fail_clear_votes.load(Ordering::SeqCst) {
                return Err(AppError::Internal(anyhow::anyhow!("votes unavailable")));
            }
            self.inner.clear_votes().await
        }
    }

    fn broker() -> MemoryBroker {
        let authorizer = TopicAuthorizer::new(Some(test_support::verifier()), Some("write-secret"), Some("read-secret"));
        MemoryBroker::new(authorizer, "demo", "dev")
    }

    async fn controller(broker: &MemoryBroker, credential: &str, store: &MemoryDemoStore) -> DemoController {
        let config = RealtimeConfig::new("demo", "dev")
            .with_endpoint("broker.test")
            .with_credential(credential);
        let manager = ConnectionManager::new(config, Arc::new(broker.clone()));
        DemoController::new(manager, Arc::new(store.clone())).await
    }

    #[tokio::test]
    async fn trigger_persists_then_publishes() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let controller = controller(&broker, &test_support::admin_token(), &store).await;

        assert_eq!(controller.trigger(ControlAction::EnableChat).await.unwrap(), DemoMode::Chat);
        assert_eq!(controller.mode().await, DemoMode::Chat);

        let snapshot = store.get_state().await.unwrap().unwrap();
        assert_eq!(snapshot.mode, DemoMode::Chat);
        assert!(snapshot.chat_enabled);
        let published = broker
            .wire_log()
            .await
            .into_iter()
            .any(|op| matches!(op, WireOp::Publish { topic, .. } if topic == "demo/dev/control"));
        assert!(published);
    }

    #[tokio::test]
    async fn denied_publish_rolls_back() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let controller = controller(&broker, "write-secret", &store).await;

        let err = controller.trigger(ControlAction::EnableVote).await.unwrap_err();
        assert!(matches!(err, AppError::Publish(_)));
        assert_eq!(controller.mode().await, DemoMode::Waiting);
        let snapshot = store.get_state().await.unwrap().unwrap();
        assert_eq!(snapshot.mode, DemoMode::Waiting);
        assert!(!snapshot.vote_enabled);
    }

    #[tokio::test]
    async fn store_failure_rolls_back_before_publishing() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let controller = controller(&broker, &test_support::admin_token(), &store).await;
        store.set_failing(true);

        assert!(controller.trigger(ControlAction::EnableEmail).await.is_err());
        assert_eq!(controller.mode().await, DemoMode::Waiting);
        assert!(broker.wire_log().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_chat_and_votes() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let admin = controller(&broker, &test_support::admin_token(), &store).await;

        admin.trigger(ControlAction::EnableVote).await.unwrap();
        admin.send_chat("ana", "hello").await.unwrap();
        admin.cast_vote("u1", VoteOption::D).await.unwrap();

        assert_eq!(admin.trigger(ControlAction::Reset).await.unwrap(), DemoMode::Waiting);
        assert!(store.list_chat(100).await.unwrap().is_empty());
        assert!(store.list_votes().await.unwrap().is_empty());
        let snapshot = store.get_state().await.unwrap().unwrap();
        assert!(!snapshot.vote_enabled);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let controller = controller(&broker, &test_support::admin_token(), &store).await;

        let err = controller.trigger(ControlAction::Unknown).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn chat_is_validated_before_anything_is_written() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let participant = controller(&broker, "write-secret", &store).await;

        let err = participant.send_chat("ana", &"x".repeat(101)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(store.list_chat(100).await.unwrap().is_empty());

        let sent = participant.send_chat("  ana ", " hi ").await.unwrap();
        assert_eq!(sent.username, "ana");
        assert_eq!(sent.text, "hi");
    }

    #[tokio::test]
    async fn re_voting_replaces_the_stored_vote() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let participant = controller(&broker, "write-secret", &store).await;

        participant.cast_vote("u1", VoteOption::A).await.unwrap();
        participant.cast_vote("u1", VoteOption::B).await.unwrap();
        let votes = store.list_votes().await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].option, VoteOption::B);

        assert!(participant.cast_vote(" ", VoteOption::A).await.is_err());
    }

    #[tokio::test]
    async fn viewer_cannot_vote_or_chat() {
        let broker = broker();
        let store = MemoryDemoStore::new();
        let viewer = controller(&broker, "read-secret", &store).await;

        let err = viewer.cast_vote("u1", VoteOption::A).await.unwrap_err();
        assert!(matches!(err, AppError::Publish(_)));
        let err = viewer.send_chat("eve", "spam").await.unwrap_err();
        assert!(matches!(err, AppError::Publish(_)));

        assert!(store.list_votes().await.unwrap().is_empty());
        assert!(store.list_chat(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_stays_confirmed_when_history_cannot_be_cleared() {
        let broker = broker();
        let store = FlakyClearStore::default();
        let config = RealtimeConfig::new("demo", "dev")
            .with_endpoint("broker.test")
            .with_credential(test_support::admin_token());
        let manager = ConnectionManager::new(config, Arc::new(broker.clone()));
        let admin = DemoController::new(manager, Arc::new(store.clone())).await;

        admin.trigger(ControlAction::EnableVote).await.unwrap();
        admin.send_chat("ana", "hello").await.unwrap();
        admin.cast_vote("u1", VoteOption::B).await.unwrap();
        store.fail_clear_votes.store(true, Ordering::SeqCst);

        assert_eq!(admin.trigger(ControlAction::Reset).await.unwrap(), DemoMode::Waiting);
        assert_eq!(admin.mode().await, DemoMode::Waiting);
        let snapshot = store.get_state().await.unwrap().unwrap();
        assert_eq!(snapshot.mode, DemoMode::Waiting);
        assert!(store.list_chat(100).await.unwrap().is_empty());
        assert_eq!(store.list_votes().await.unwrap().len(), 1);
    }
}
