//! Redis-backed demo store: snapshot as a JSON string, chat and votes as hashes.

use crate::error::{AppError, AppResult};
use crate::models::demo::{DemoSnapshot, DemoStateUpdate};
use crate::models::message::{ChatMessage, VoteMessage};
use crate::repositories::{newest_chat, DemoStore};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

const KEY_PREFIX: &str = "stagecast:";

/// Keys for one application stage.
#[derive(Debug, Clone)]
struct Keys {
    state: String,
    chat: String,
    votes: String,
}

impl Keys {
    fn new(app_name: &str, stage: &str) -> Self {
        let base = format!("{}{}:{}", KEY_PREFIX, app_name, stage);
        Self {
            state: format!("{}:state", base),
            chat: format!("{}:chat", base),
            votes: format!("{}:votes", base),
        }
    }
}

#[derive(Clone)]
pub struct RedisDemoStore {
    client: Arc<redis::Client>,
    keys: Keys,
}

impl RedisDemoStore {
    /// Create a store from a Redis URL. No connection is made until first use.
    pub fn new(redis_url: &str, app_name: &str, stage: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        info!(app = %app_name, stage = %stage, "redis demo store ready");
        Ok(Self {
            client: Arc::new(client),
            keys: Keys::new(app_name, stage),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    async fn write_state(&self, snapshot: &DemoSnapshot) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(snapshot)?;
        conn.set::<_, _, ()>(&self.keys.state, json).await?;
        Ok(())
    }
}

#[async_trait]
impl DemoStore for RedisDemoStore {
    async fn get_state(&self) -> AppResult<Option<DemoSnapshot>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(&self.keys.state).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(AppError::from))
            .transpose()
    }

    async fn upsert_state(&self, update: &DemoStateUpdate) -> AppResult<DemoSnapshot> {
        let mut snapshot = self.get_state().await?.unwrap_or_else(DemoSnapshot::initial);
        snapshot.apply(update);
        self.write_state(&snapshot).await?;
        debug!(mode = %snapshot.mode, "demo state saved");
        Ok(snapshot)
    }

    async fn reset_state(&self) -> AppResult<DemoSnapshot> {
        let snapshot = DemoSnapshot::initial();
        self.write_state(&snapshot).await?;
        Ok(snapshot)
    }

    async fn append_chat(&self, message: &ChatMessage) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(message)?;
        conn.hset::<_, _, _, ()>(&self.keys.chat, &message.id, json).await?;
        Ok(())
    }

    async fn list_chat(&self, limit: usize) -> AppResult<Vec<ChatMessage>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn.hvals(&self.keys.chat).await?;
        let messages = raw
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<Result<Vec<ChatMessage>, _>>()?;
        Ok(newest_chat(messages, limit))
    }

    async fn clear_chat(&self) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(&self.keys.chat).await?;
        Ok(())
    }

    async fn upsert_vote(&self, vote: &VoteMessage) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(vote)?;
        conn.hset::<_, _, _, ()>(&self.keys.votes, &vote.user_id, json).await?;
        Ok(())
    }

    async fn list_votes(&self) -> AppResult<Vec<VoteMessage>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn.hvals(&self.keys.votes).await?;
        let mut votes = raw
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<Result<Vec<VoteMessage>, _>>()?;
        votes.sort_by_key(|v| v.timestamp);
        Ok(votes)
    }

    async fn clear_votes(&self) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(&self.keys.votes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::demo::DemoMode;

    #[test]
    fn keys_are_scoped_to_app_and_stage() {
        let keys = Keys::new("demo", "prod");
        assert_eq!(keys.state, "stagecast:demo:prod:state");
        assert_eq!(keys.chat, "stagecast:demo:prod:chat");
        assert_eq!(keys.votes, "stagecast:demo:prod:votes");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisDemoStore::new("not a url", "demo", "dev").is_err());
    }

    /// Needs a live Redis; set `TEST_REDIS_URL` to run.
    #[tokio::test]
    async fn snapshot_round_trips_through_redis() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("Skip redis test: set TEST_REDIS_URL");
            return;
        };
        let stage = format!("test-{}", uuid::Uuid::new_v4().simple());
        let store = RedisDemoStore::new(&url, "demo", &stage).unwrap();

        assert!(store.get_state().await.unwrap().is_none());
        let saved = store
            .upsert_state(&DemoStateUpdate::for_mode(DemoMode::Vote))
            .await
            .unwrap();
        assert_eq!(saved.mode, DemoMode::Vote);
        assert!(saved.vote_enabled);
        assert_eq!(store.get_state().await.unwrap(), Some(saved));

        store.reset_state().await.unwrap();
        store.clear_chat().await.unwrap();
        store.clear_votes().await.unwrap();
    }
}
