//! In-process demo store for tests and single-node runs.

use crate::error::{AppError, AppResult};
use crate::models::demo::{DemoSnapshot, DemoStateUpdate};
use crate::models::message::{ChatMessage, VoteMessage};
use crate::repositories::{newest_chat, DemoStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    state: Option<DemoSnapshot>,
    chat: HashMap<String, ChatMessage>,
    votes: HashMap<String, VoteMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryDemoStore {
    tables: Arc<RwLock<Tables>>,
    failing: Arc<AtomicBool>,
}

impl MemoryDemoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, to exercise error paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("demo store unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl DemoStore for MemoryDemoStore {
    async fn get_state(&self) -> AppResult<Option<DemoSnapshot>> {
        self.check()?;
        Ok(self.tables.read().await.state.clone())
    }

    async fn upsert_state(&self, update: &DemoStateUpdate) -> AppResult<DemoSnapshot> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let snapshot = tables.state.get_or_insert_with(DemoSnapshot::initial);
        snapshot.apply(update);
        Ok(snapshot.clone())
    }

    async fn reset_state(&self) -> AppResult<DemoSnapshot> {
        self.check()?;
        let snapshot = DemoSnapshot::initial();
        self.tables.write().await.state = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn append_chat(&self, message: &ChatMessage) -> AppResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .chat
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn list_chat(&self, limit: usize) -> AppResult<Vec<ChatMessage>> {
        self.check()?;
        let messages = self.tables.read().await.chat.values().cloned().collect();
        Ok(newest_chat(messages, limit))
    }

    async fn clear_chat(&self) -> AppResult<()> {
        self.check()?;
        self.tables.write().await.chat.clear();
        Ok(())
    }

    async fn upsert_vote(&self, vote: &VoteMessage) -> AppResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .votes
            .insert(vote.user_id.clone(), vote.clone());
        Ok(())
    }

    async fn list_votes(&self) -> AppResult<Vec<VoteMessage>> {
        self.check()?;
        let mut votes: Vec<_> = self.tables.read().await.votes.values().cloned().collect();
        votes.sort_by_key(|v| v.timestamp);
        Ok(votes)
    }

    async fn clear_votes(&self) -> AppResult<()> {
        self.check()?;
        self.tables.write().await.votes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::demo::DemoMode;
    use crate::models::message::VoteOption;

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let store = MemoryDemoStore::new();
        assert!(store.get_state().await.unwrap().is_none());

        let first = store
            .upsert_state(&DemoStateUpdate::for_mode(DemoMode::Chat))
            .await
            .unwrap();
        assert!(first.chat_enabled);
        let second = store
            .upsert_state(&DemoStateUpdate::for_mode(DemoMode::Vote))
            .await
            .unwrap();
        assert_eq!(second.mode, DemoMode::Vote);
        assert!(second.chat_enabled && second.vote_enabled);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn re_voting_replaces_the_previous_vote() {
        let store = MemoryDemoStore::new();
        for (option, timestamp) in [(VoteOption::A, 1), (VoteOption::C, 2)] {
            store
                .upsert_vote(&VoteMessage {
                    option,
                    user_id: "u1".to_string(),
                    timestamp,
                })
                .await
                .unwrap();
        }
        let votes = store.list_votes().await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].option, VoteOption::C);
    }

    #[tokio::test]
    async fn failing_store_errors_every_call() {
        let store = MemoryDemoStore::new();
        store.set_failing(true);
        assert!(store.get_state().await.is_err());
        assert!(store.list_chat(10).await.is_err());
        store.set_failing(false);
        assert!(store.get_state().await.is_ok());
    }
}
