//! Permission grants handed to a connection by the topic authorizer.

use crate::models::topic::{pattern_matches, topic_for, wildcard, TopicKind};
use serde::{Deserialize, Serialize};

/// Identity tier resolved from a presented credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Administrator,
    Participant,
    Viewer,
    Unauthenticated,
}

/// Topic patterns a connection may publish and subscribe to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl PermissionGrant {
    /// Grant for a tier within one application stage.
    pub fn for_tier(tier: Tier, app_name: &str, stage: &str) -> Self {
        let all = wildcard(app_name, stage);
        let topic = |kind| topic_for(kind, app_name, stage).to_string();
        match tier {
            Tier::Administrator => Self {
                publish: vec![all.clone()],
                subscribe: vec![all],
            },
            Tier::Participant => Self {
                publish: vec![topic(TopicKind::Chat), topic(TopicKind::Vote)],
                subscribe: vec![all],
            },
            Tier::Viewer => Self {
                publish: vec![topic(TopicKind::ReadOnlySink)],
                subscribe: vec![all],
            },
            Tier::Unauthenticated => Self::empty(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// An empty grant admits the connection but allows nothing.
    pub fn is_empty(&self) -> bool {
        self.publish.is_empty() && self.subscribe.is_empty()
    }

    pub fn allows_publish(&self, topic: &str) -> bool {
        self.publish.iter().any(|p| pattern_matches(p, topic))
    }

    pub fn allows_subscribe(&self, topic: &str) -> bool {
        self.subscribe.iter().any(|p| pattern_matches(p, topic))
    }
}
