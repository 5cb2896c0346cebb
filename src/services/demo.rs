//! Demo state machine: mode reducer, bootstrap from the store, reconciliation
//! of persisted and live messages, and the optimistic mode view.

use crate::models::demo::{DemoMode, VoteTally};
use crate::models::message::{ChatMessage, ControlAction, ControlMessage, Message, VoteMessage};
use crate::repositories::DemoStore;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, warn};

/// Starting mode from the persisted snapshot; `Waiting` when absent or unreadable.
pub async fn bootstrap(store: &dyn DemoStore) -> DemoMode {
    match store.get_state().await {
        Ok(Some(snapshot)) => {
            debug!(mode = %snapshot.mode, "bootstrapped from snapshot");
            snapshot.mode
        }
        Ok(None) => DemoMode::Waiting,
        Err(e) => {
            warn!(error = %e, "could not read demo snapshot, starting in waiting");
            DemoMode::Waiting
        }
    }
}

/// Next mode after a control message. Unknown actions leave the mode alone.
pub fn apply(mode: DemoMode, control: &ControlMessage) -> DemoMode {
    control.action.target_mode().unwrap_or(mode)
}

/// Insertion-ordered merge keyed by identity. `replace(old, new)` decides whether `new` wins.
fn merge<'a, T, K, I>(items: I, key: impl Fn(&T) -> K, replace: impl Fn(&T, &T) -> bool) -> Vec<T>
where
    T: Clone + 'a,
    K: Eq + Hash,
    I: IntoIterator<Item = &'a T>,
{
    let mut slots: Vec<T> = Vec::new();
    let mut index: HashMap<K, usize> = HashMap::new();
    for item in items {
        match index.get(&key(item)) {
            Some(&at) => {
                if replace(&slots[at], item) {
                    slots[at] = item.clone();
                }
            }
            None => {
                index.insert(key(item), slots.len());
                slots.push(item.clone());
            }
        }
    }
    slots
}

/// Chat history: one entry per `id`, the last one inserted wins.
pub fn reconcile_chat(initial: &[ChatMessage], incoming: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged = merge(initial.iter().chain(incoming), |m| m.id.clone(), |_, _| true);
    merged.sort_by_key(|m| m.timestamp);
    merged
}

/// Votes: one entry per user, the latest `timestamp` wins and ties go to the later insertion.
pub fn reconcile_votes(initial: &[VoteMessage], incoming: &[VoteMessage]) -> Vec<VoteMessage> {
    let mut merged = merge(
        initial.iter().chain(incoming),
        |v| v.user_id.clone(),
        |old, new| new.timestamp >= old.timestamp,
    );
    merged.sort_by_key(|v| v.timestamp);
    merged
}

#[derive(PartialEq, Eq, Hash)]
enum Identity {
    Chat(String),
    Vote(String),
    Control(ControlAction, i64),
}

fn identity(message: &Message) -> Identity {
    match message {
        Message::Chat(m) => Identity::Chat(m.id.clone()),
        Message::Vote(m) => Identity::Vote(m.user_id.clone()),
        Message::Control(m) => Identity::Control(m.action, m.timestamp),
    }
}

/// Mixed-kind reconciliation with the same rules as [`reconcile_chat`] and [`reconcile_votes`].
/// Identical control messages collapse to one.
pub fn reconcile(initial: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut merged = merge(initial.iter().chain(incoming), identity, |old, new| match (old, new) {
        (Message::Vote(old), Message::Vote(new)) => new.timestamp >= old.timestamp,
        _ => true,
    });
    merged.sort_by_key(Message::timestamp);
    merged
}

/// Counts per option, recomputed from reconciled votes.
pub fn tally(votes: &[VoteMessage]) -> VoteTally {
    votes.iter().collect()
}

/// Confirmed mode plus an optional optimistic one awaiting confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeView {
    confirmed: DemoMode,
    pending: Option<DemoMode>,
}

impl ModeView {
    pub fn new(confirmed: DemoMode) -> Self {
        Self {
            confirmed,
            pending: None,
        }
    }

    pub fn confirmed(&self) -> DemoMode {
        self.confirmed
    }

    pub fn pending(&self) -> Option<DemoMode> {
        self.pending
    }

    /// What to show: the pending mode if any, else the confirmed one.
    pub fn current(&self) -> DemoMode {
        self.pending.unwrap_or(self.confirmed)
    }

    pub fn propose(&mut self, mode: DemoMode) {
        self.pending = Some(mode);
    }

    /// Promote the pending mode. No-op without one.
    pub fn confirm(&mut self) -> DemoMode {
        if let Some(mode) = self.pending.take() {
            self.confirmed = mode;
        }
        self.confirmed
    }

    pub fn rollback(&mut self) -> DemoMode {
        self.pending = None;
        self.confirmed
    }

    /// A control message seen on the wire is authoritative and clears any pending mode.
    pub fn apply_control(&mut self, control: &ControlMessage) -> DemoMode {
        if control.action.target_mode().is_some() {
            self.confirmed = apply(self.confirmed, control);
            self.pending = None;
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::VoteOption;
    use crate::repositories::MemoryDemoStore;

    fn chat(id: &str, text: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            text: text.to_string(),
            username: "ana".to_string(),
            timestamp,
        }
    }

    fn vote(user: &str, option: VoteOption, timestamp: i64) -> VoteMessage {
        VoteMessage {
            option,
            user_id: user.to_string(),
            timestamp,
        }
    }

    fn control(action: ControlAction) -> ControlMessage {
        ControlMessage {
            action,
            timestamp: 10,
        }
    }

    #[test]
    fn reset_and_enable_vote_from_every_mode() {
        for mode in DemoMode::ALL {
            assert_eq!(apply(mode, &control(ControlAction::Reset)), DemoMode::Waiting);
            assert_eq!(apply(mode, &control(ControlAction::EnableVote)), DemoMode::Vote);
            assert_eq!(apply(mode, &control(ControlAction::Unknown)), mode);
        }
    }

    #[test]
    fn duplicate_chat_ids_keep_the_last_insertion() {
        let merged = reconcile_chat(&[chat("m1", "first", 1)], &[chat("m1", "edited", 1)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "edited");
    }

    #[test]
    fn chat_is_ordered_by_timestamp() {
        let merged = reconcile_chat(&[chat("b", "x", 5), chat("a", "x", 9)], &[chat("c", "x", 1)]);
        let ids: Vec<_> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn votes_collapse_to_the_latest_timestamp() {
        let later_first = reconcile_votes(&[vote("u1", VoteOption::B, 20)], &[vote("u1", VoteOption::A, 10)]);
        assert_eq!(later_first, vec![vote("u1", VoteOption::B, 20)]);

        let later_second = reconcile_votes(&[vote("u1", VoteOption::A, 10)], &[vote("u1", VoteOption::B, 20)]);
        assert_eq!(later_second, vec![vote("u1", VoteOption::B, 20)]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let initial = vec![
            Message::Chat(chat("m1", "hi", 1)),
            Message::Vote(vote("u1", VoteOption::A, 2)),
        ];
        let incoming = vec![
            Message::Chat(chat("m1", "hi again", 3)),
            Message::Vote(vote("u1", VoteOption::D, 4)),
            Message::Chat(chat("m2", "yo", 5)),
            Message::Control(control(ControlAction::EnableChat)),
        ];
        let once = reconcile(&initial, &incoming);
        let twice = reconcile(&once, &incoming);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 4);
    }

    #[test]
    fn tally_follows_reconciled_votes() {
        let votes = reconcile_votes(
            &[vote("u1", VoteOption::A, 1), vote("u2", VoteOption::A, 2)],
            &[vote("u1", VoteOption::C, 3)],
        );
        let counts = tally(&votes);
        assert_eq!(counts.count(VoteOption::A), 1);
        assert_eq!(counts.count(VoteOption::C), 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn bootstrap_defaults_to_waiting() {
        let store = MemoryDemoStore::new();
        assert_eq!(tokio_test::block_on(bootstrap(&store)), DemoMode::Waiting);

        store.set_failing(true);
        assert_eq!(tokio_test::block_on(bootstrap(&store)), DemoMode::Waiting);
    }

    #[tokio::test]
    async fn bootstrap_reads_the_snapshot() {
        let store = MemoryDemoStore::new();
        store
            .upsert_state(&crate::models::demo::DemoStateUpdate::for_mode(DemoMode::Email))
            .await
            .unwrap();
        assert_eq!(bootstrap(&store).await, DemoMode::Email);
    }

    #[test]
    fn mode_view_tracks_pending_and_confirmed() {
        let mut view = ModeView::new(DemoMode::Waiting);
        view.propose(DemoMode::Chat);
        assert_eq!(view.current(), DemoMode::Chat);
        assert_eq!(view.confirmed(), DemoMode::Waiting);

        assert_eq!(view.rollback(), DemoMode::Waiting);
        assert_eq!(view.current(), DemoMode::Waiting);

        view.propose(DemoMode::Vote);
        assert_eq!(view.confirm(), DemoMode::Vote);
        assert_eq!(view.pending(), None);
    }

    #[test]
    fn control_on_the_wire_overrides_pending() {
        let mut view = ModeView::new(DemoMode::Chat);
        view.propose(DemoMode::Vote);
        assert_eq!(view.apply_control(&control(ControlAction::EnableEmail)), DemoMode::Email);
        assert_eq!(view.pending(), None);

        view.propose(DemoMode::Chat);
        assert_eq!(view.apply_control(&control(ControlAction::Unknown)), DemoMode::Chat);
        assert_eq!(view.confirmed(), DemoMode::Email);
    }
}
