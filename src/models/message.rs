//! Wire messages for the chat, vote and control topics.

use crate::error::{AppError, AppResult};
use crate::models::demo::DemoMode;
use crate::models::topic::TopicKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Current Unix time in milliseconds, the timestamp unit on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ChatMessage {
    pub id: String,
    #[validate(length(min = 1, max = 100))]
    pub text: String,
    #[validate(length(min = 1, max = 32))]
    pub username: String,
    pub timestamp: i64,
}

impl ChatMessage {
    /// New message with a fresh id, stamped now.
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            username: username.into(),
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteOption {
    A,
    B,
    C,
    D,
}

impl VoteOption {
    pub const ALL: [VoteOption; 4] = [VoteOption::A, VoteOption::B, VoteOption::C, VoteOption::D];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteMessage {
    pub option: VoteOption,
    pub user_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    EnableChat,
    EnableVote,
    EnableEmail,
    Reset,
    /// Any action this build does not know. Ignored by the reducer.
    #[serde(other)]
    Unknown,
}

impl ControlAction {
    /// Mode a control action moves the demo to, `None` for unknown actions.
    pub fn target_mode(&self) -> Option<DemoMode> {
        match self {
            ControlAction::EnableChat => Some(DemoMode::Chat),
            ControlAction::EnableVote => Some(DemoMode::Vote),
            ControlAction::EnableEmail => Some(DemoMode::Email),
            ControlAction::Reset => Some(DemoMode::Waiting),
            ControlAction::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub timestamp: i64,
}

impl ControlMessage {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            timestamp: now_millis(),
        }
    }
}

/// Payload keyed by the topic kind it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Chat(ChatMessage),
    Vote(VoteMessage),
    Control(ControlMessage),
}

impl Message {
    pub fn kind(&self) -> TopicKind {
        match self {
            Message::Chat(_) => TopicKind::Chat,
            Message::Vote(_) => TopicKind::Vote,
            Message::Control(_) => TopicKind::Control,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Message::Chat(m) => m.timestamp,
            Message::Vote(m) => m.timestamp,
            Message::Control(m) => m.timestamp,
        }
    }

    /// Decode a payload received on a topic of the given kind.
    pub fn decode(kind: TopicKind, payload: &str) -> AppResult<Self> {
        match kind {
            TopicKind::Chat => decode(payload).map(Message::Chat),
            TopicKind::Vote => decode(payload).map(Message::Vote),
            TopicKind::Control => decode(payload).map(Message::Control),
            TopicKind::ReadOnlySink => Err(AppError::Decode(
                "no messages are carried on the read-only sink".to_string(),
            )),
        }
    }

    pub fn encode(&self) -> AppResult<String> {
        let text = match self {
            Message::Chat(m) => serde_json::to_string(m)?,
            Message::Vote(m) => serde_json::to_string(m)?,
            Message::Control(m) => serde_json::to_string(m)?,
        };
        Ok(text)
    }
}

/// Decode a JSON payload, reporting failures as [`AppError::Decode`].
pub fn decode<T: DeserializeOwned>(payload: &str) -> AppResult<T> {
    serde_json::from_str(payload).map_err(|e| AppError::Decode(e.to_string()))
}
