//! Demo mode, the persisted snapshot, and vote tallies.

use crate::models::message::{now_millis, VoteMessage, VoteOption};
use serde::{Deserialize, Serialize};

/// Which screen the audience is on. Exactly one per application instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoMode {
    #[default]
    Waiting,
    Chat,
    Vote,
    Email,
}

impl DemoMode {
    pub const ALL: [DemoMode; 4] = [DemoMode::Waiting, DemoMode::Chat, DemoMode::Vote, DemoMode::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            DemoMode::Waiting => "waiting",
            DemoMode::Chat => "chat",
            DemoMode::Vote => "vote",
            DemoMode::Email => "email",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DemoMode::Waiting => "Waiting Room",
            DemoMode::Chat => "Live Chat",
            DemoMode::Vote => "Live Poll",
            DemoMode::Email => "Thank You",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DemoMode::Waiting => "Show waiting screen",
            DemoMode::Chat => "Enable real-time chat",
            DemoMode::Vote => "Start the live poll",
            DemoMode::Email => "Final thank you + optional email recap",
        }
    }
}

impl std::fmt::Display for DemoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const SNAPSHOT_ID: &str = "current";

/// Persisted demo state: a single record with id `current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoSnapshot {
    pub id: String,
    pub mode: DemoMode,
    pub chat_enabled: bool,
    pub vote_enabled: bool,
    pub updated_at: i64,
    pub created_at: i64,
}

impl DemoSnapshot {
    /// Fresh snapshot in the waiting room.
    pub fn initial() -> Self {
        let now = now_millis();
        Self {
            id: SNAPSHOT_ID.to_string(),
            mode: DemoMode::Waiting,
            chat_enabled: false,
            vote_enabled: false,
            updated_at: now,
            created_at: now,
        }
    }

    /// Merge a partial update, bumping `updated_at`. `created_at` never changes.
    pub fn apply(&mut self, update: &DemoStateUpdate) {
        if let Some(mode) = update.mode {
            self.mode = mode;
        }
        if let Some(chat) = update.chat_enabled {
            self.chat_enabled = chat;
        }
        if let Some(vote) = update.vote_enabled {
            self.vote_enabled = vote;
        }
        self.updated_at = now_millis();
    }
}

/// Partial snapshot update (upsert semantics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoStateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DemoMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_enabled: Option<bool>,
}

impl DemoStateUpdate {
    /// Update recording a move to `mode`; entering chat or vote also turns that feature on.
    pub fn for_mode(mode: DemoMode) -> Self {
        let mut update = Self {
            mode: Some(mode),
            ..Default::default()
        };
        match mode {
            DemoMode::Chat => update.chat_enabled = Some(true),
            DemoMode::Vote => update.vote_enabled = Some(true),
            DemoMode::Waiting => {
                update.chat_enabled = Some(false);
                update.vote_enabled = Some(false);
            }
            DemoMode::Email => {}
        }
        update
    }
}

/// Per-option vote counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    #[serde(rename = "A")]
    pub a: u64,
    #[serde(rename = "B")]
    pub b: u64,
    #[serde(rename = "C")]
    pub c: u64,
    #[serde(rename = "D")]
    pub d: u64,
}

impl VoteTally {
    pub fn count(&self, option: VoteOption) -> u64 {
        match option {
            VoteOption::A => self.a,
            VoteOption::B => self.b,
            VoteOption::C => self.c,
            VoteOption::D => self.d,
        }
    }

    pub fn total(&self) -> u64 {
        self.a + self.b + self.c + self.d
    }

    /// Whole-number share of the total for an option, 0 when nobody voted.
    pub fn percentage(&self, option: VoteOption) -> u64 {
        match self.total() {
            0 => 0,
            total => (self.count(option) * 100 + total / 2) / total,
        }
    }

    fn bump(&mut self, option: VoteOption) {
        match option {
            VoteOption::A => self.a += 1,
            VoteOption::B => self.b += 1,
            VoteOption::C => self.c += 1,
            VoteOption::D => self.d += 1,
        }
    }
}

impl<'a> FromIterator<&'a VoteMessage> for VoteTally {
    fn from_iter<I: IntoIterator<Item = &'a VoteMessage>>(iter: I) -> Self {
        let mut tally = VoteTally::default();
        for vote in iter {
            tally.bump(vote.option);
        }
        tally
    }
}
