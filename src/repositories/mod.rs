//! Persistence for the demo: snapshot, chat history and votes.

pub mod memory;
pub mod redis_repo;

pub use memory::MemoryDemoStore;
pub use redis_repo::RedisDemoStore;

use crate::error::AppResult;
use crate::models::demo::{DemoSnapshot, DemoStateUpdate};
use crate::models::message::{ChatMessage, VoteMessage};
use async_trait::async_trait;

/// Storage the demo reads on startup and writes on every operator or audience action.
/// Every call may fail; callers decide whether absence is fatal.
#[async_trait]
pub trait DemoStore: Send + Sync {
    async fn get_state(&self) -> AppResult<Option<DemoSnapshot>>;
    /// Merge `update` into the snapshot, creating it if absent.
    async fn upsert_state(&self, update: &DemoStateUpdate) -> AppResult<DemoSnapshot>;
    /// Back to the waiting room with chat and vote disabled.
    async fn reset_state(&self) -> AppResult<DemoSnapshot>;

    async fn append_chat(&self, message: &ChatMessage) -> AppResult<()>;
    /// The newest `limit` messages, oldest first.
    async fn list_chat(&self, limit: usize) -> AppResult<Vec<ChatMessage>>;
    async fn clear_chat(&self) -> AppResult<()>;

    /// One vote per user; a new vote replaces the old one.
    async fn upsert_vote(&self, vote: &VoteMessage) -> AppResult<()>;
    async fn list_votes(&self) -> AppResult<Vec<VoteMessage>>;
    async fn clear_votes(&self) -> AppResult<()>;
}

/// Newest `limit` of `messages`, returned oldest first.
pub(crate) fn newest_chat(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    messages.sort_by_key(|m| m.timestamp);
    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}
