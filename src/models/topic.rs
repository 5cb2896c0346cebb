//! Topic kinds and naming conventions.
//!
//! Every topic string in the crate comes from [`topic_for`]; `Topic` has no
//! other public constructor, so prefixes stay consistent across stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic kind: the last segment of `{app}/{stage}/{kind}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Chat,
    Vote,
    Control,
    /// Sink granted to viewers so the broker keeps the connection open. Carries no traffic.
    #[serde(rename = "_readonly_dummy")]
    ReadOnlySink,
}

impl TopicKind {
    pub const ALL: [TopicKind; 4] = [
        TopicKind::Chat,
        TopicKind::Vote,
        TopicKind::Control,
        TopicKind::ReadOnlySink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Chat => "chat",
            TopicKind::Vote => "vote",
            TopicKind::Control => "control",
            TopicKind::ReadOnlySink => "_readonly_dummy",
        }
    }
}

/// A fully namespaced topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Topic prefix for an application stage: `{app}/{stage}`.
pub fn namespace(app_name: &str, stage: &str) -> String {
    format!("{}/{}", app_name, stage)
}

/// Full topic for a kind: `{app}/{stage}/{kind}`.
pub fn topic_for(kind: TopicKind, app_name: &str, stage: &str) -> Topic {
    Topic(format!("{}/{}", namespace(app_name, stage), kind.as_str()))
}

/// Pattern covering every topic of an application stage: `{app}/{stage}/*`.
pub fn wildcard(app_name: &str, stage: &str) -> String {
    format!("{}/*", namespace(app_name, stage))
}

/// Match a grant pattern against a topic. A trailing `/*` matches any
/// non-empty remainder under that prefix; anything else must be equal.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => {
            topic.len() > prefix.len() && topic.starts_with(prefix)
        }
        _ => pattern == topic,
    }
}
