//! Audience-side demo session: follows the control, chat and vote topics and
//! keeps a reconciled local view.

use crate::error::AppResult;
use crate::models::demo::{DemoMode, VoteTally};
use crate::models::message::{ChatMessage, ControlMessage, Message, VoteMessage};
use crate::models::topic::{topic_for, Topic, TopicKind};
use crate::repositories::DemoStore;
use crate::services::connection::{ConnectionManager, MessageHandler};
use crate::services::demo::{self, ModeView};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Chat messages loaded on start.
pub const CHAT_HISTORY_LIMIT: usize = 100;

#[derive(Default)]
struct View {
    mode: ModeView,
    chat: Vec<ChatMessage>,
    votes: Vec<VoteMessage>,
}

struct Shared {
    view: Mutex<View>,
    mode_tx: watch::Sender<DemoMode>,
}

impl Shared {
    fn view(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_control(&self, payload: &str) {
        let Some(Message::Control(control)) = decode_or_drop(TopicKind::Control, payload) else {
            return;
        };
        let mode = self.view().mode.apply_control(&control);
        info!(action = ?control.action, mode = %mode, "control received");
        self.mode_tx.send_replace(mode);
    }

    fn on_chat(&self, payload: &str) {
        if let Some(Message::Chat(message)) = decode_or_drop(TopicKind::Chat, payload) {
            let mut view = self.view();
            view.chat = demo::reconcile_chat(&view.chat, &[message]);
        }
    }

    fn on_vote(&self, payload: &str) {
        if let Some(Message::Vote(vote)) = decode_or_drop(TopicKind::Vote, payload) {
            let mut view = self.view();
            view.votes = demo::reconcile_votes(&view.votes, &[vote]);
        }
    }
}

fn decode_or_drop(kind: TopicKind, payload: &str) -> Option<Message> {
    match Message::decode(kind, payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(kind = kind.as_str(), error = %e, "dropping malformed payload");
            None
        }
    }
}

/// A live view of one application stage. Dropping it leaves the handlers registered; call [`DemoSession::stop`].
pub struct DemoSession {
    manager: ConnectionManager,
    shared: Arc<Shared>,
    subscriptions: Vec<(Topic, MessageHandler)>,
}

impl DemoSession {
    /// Bootstrap from the store, load history, then follow the live topics.
    #[instrument(skip(manager, store))]
    pub async fn start(
        manager: ConnectionManager,
        store: &dyn DemoStore,
        app_name: &str,
        stage: &str,
    ) -> AppResult<Self> {
        let mode = demo::bootstrap(store).await;
        let chat = store.list_chat(CHAT_HISTORY_LIMIT).await.unwrap_or_else(|e| {
            warn!(error = %e, "could not load chat history");
            Vec::new()
        });
        let votes = store.list_votes().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not load votes");
            Vec::new()
        });

        let (mode_tx, _) = watch::channel(mode);
        let shared = Arc::new(Shared {
            view: Mutex::new(View {
                mode: ModeView::new(mode),
                chat: demo::reconcile_chat(&chat, &[]),
                votes: demo::reconcile_votes(&votes, &[]),
            }),
            mode_tx,
        });

        let mut session = Self {
            manager,
            shared: shared.clone(),
            subscriptions: Vec::new(),
        };
        let handlers: [(TopicKind, MessageHandler); 3] = [
            (TopicKind::Control, {
                let shared = shared.clone();
                MessageHandler::new(move |payload| shared.on_control(payload))
            }),
            (TopicKind::Chat, {
                let shared = shared.clone();
                MessageHandler::new(move |payload| shared.on_chat(payload))
            }),
            (TopicKind::Vote, {
                let shared = shared.clone();
                MessageHandler::new(move |payload| shared.on_vote(payload))
            }),
        ];
        for (kind, handler) in handlers {
            let topic = topic_for(kind, app_name, stage);
            if let Err(e) = session.manager.subscribe(&topic, handler.clone()).await {
                session.stop().await;
                return Err(e);
            }
            session.subscriptions.push((topic, handler));
        }

        info!(mode = %mode, chat = session.chat().len(), votes = session.votes().len(), "demo session started");
        Ok(session)
    }

    pub fn mode(&self) -> DemoMode {
        self.shared.view().mode.current()
    }

    pub fn mode_view(&self) -> ModeView {
        self.shared.view().mode
    }

    /// Receiver that sees every mode change.
    pub fn watch_mode(&self) -> watch::Receiver<DemoMode> {
        self.shared.mode_tx.subscribe()
    }

    /// Optimistically show `mode` before the operator's control message arrives.
    pub fn propose_mode(&self, mode: DemoMode) {
        self.shared.view().mode.propose(mode);
        self.shared.mode_tx.send_replace(mode);
    }

    /// Apply a control message locally, as if it had arrived on the wire.
    pub fn apply_control(&self, control: &ControlMessage) -> DemoMode {
        let mode = self.shared.view().mode.apply_control(control);
        self.shared.mode_tx.send_replace(mode);
        mode
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.shared.view().chat.clone()
    }

    pub fn votes(&self) -> Vec<VoteMessage> {
        self.shared.view().votes.clone()
    }

    pub fn tally(&self) -> VoteTally {
        demo::tally(&self.shared.view().votes)
    }

    /// Unregister this session's handlers. The connection stays up for other users.
    pub async fn stop(&mut self) {
        for (topic, handler) in self.subscriptions.drain(..) {
            if let Err(e) = self.manager.unsubscribe(&topic, &handler).await {
                warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
    }
}
