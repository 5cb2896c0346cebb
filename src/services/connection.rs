//! Connection manager: one multiplexed transport connection per identity,
//! one wire subscription per topic, fan-out to local handlers.

use crate::config::RealtimeConfig;
use crate::error::{AppError, AppResult};
use crate::models::topic::Topic;
use crate::transport::{
    broker_url, generate_client_id, Transport, TransportEvent, TransportFactory, TransportOptions,
    PROTOCOL_VERSION,
};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications for observers of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnecting,
    Error(String),
    Closed,
}

/// Callback for raw payloads on a topic. Handlers compare by identity.
#[derive(Clone)]
pub struct MessageHandler(Arc<dyn Fn(&str) + Send + Sync>);

impl MessageHandler {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn call(&self, payload: &str) {
        (self.0)(payload)
    }
}

impl PartialEq for MessageHandler {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageHandler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

struct Link {
    transport: Arc<dyn Transport>,
    generation: u64,
}

struct Inner {
    config: RealtimeConfig,
    factory: Arc<dyn TransportFactory>,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Link>>,
    /// topic -> handlers in registration order. Held across wire (un)subscribe calls.
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Serializes the decision to start a new attempt.
    attempt: Mutex<()>,
    last_error: std::sync::Mutex<Option<String>>,
    generation: AtomicU64,
    /// Last generation whose transport reported `Connected`.
    connected_generation: AtomicU64,
}

/// Shared handle to one connection identity. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: RealtimeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                state,
                link: RwLock::new(None),
                handlers: Mutex::new(HashMap::new()),
                events,
                attempt: Mutex::new(()),
                last_error: std::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                connected_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Connect within the configured timeout. Concurrent callers share one attempt.
    pub async fn connect(&self) -> AppResult<()> {
        self.connect_with_timeout(self.inner.config.connect_timeout)
            .await
    }

    /// Wait at most `timeout` for the shared attempt. Running out of time fails this
    /// caller only; the attempt itself is bounded by the configured connect timeout.
    #[instrument(skip(self), fields(app = %self.inner.config.app_name, stage = %self.inner.config.stage))]
    pub async fn connect_with_timeout(&self, timeout: Duration) -> AppResult<()> {
        let (url, credential) = self.inner.target()?;

        let mut state_rx = {
            let _attempt = self.inner.attempt.lock().await;
            let current = self.state();
            let state_rx = self.inner.state.subscribe();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    self.start_attempt(&url, credential).await?;
                }
            }
            state_rx
        };

        match tokio::time::timeout(timeout, self.inner.settled(&mut state_rx)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(?timeout, "gave up waiting for connect");
                Err(AppError::Connection(format!(
                    "connect timed out after {:?}",
                    timeout
                )))
            }
        }
    }

    async fn start_attempt(&self, url: &str, credential: String) -> AppResult<()> {
        if let Some(stale) = self.inner.link.write().await.take() {
            stale.transport.end().await;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_last_error(None);
        self.inner.state.send_replace(ConnectionState::Connecting);

        let options = TransportOptions {
            protocol_version: PROTOCOL_VERSION,
            username: String::new(),
            password: credential,
            client_id: generate_client_id(),
            reconnect_period: self.inner.config.reconnect_period,
            connect_timeout: self.inner.config.connect_timeout,
        };
        info!(client_id = %options.client_id, generation, "connecting");

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.factory.open(url, options, tx).await {
            Ok(transport) => {
                *self.inner.link.write().await = Some(Link {
                    transport,
                    generation,
                });
                tokio::spawn(run_events(Arc::downgrade(&self.inner), rx, generation));
                tokio::spawn(connect_deadline(
                    Arc::downgrade(&self.inner),
                    generation,
                    self.inner.config.connect_timeout,
                ));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "transport failed to open");
                self.inner.set_last_error(Some(e.to_string()));
                self.inner.state.send_replace(ConnectionState::Disconnected);
                Err(AppError::Connection(e.to_string()))
            }
        }
    }

    /// Register `handler` for `topic`. Only the first handler on a topic subscribes on the wire.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn subscribe(&self, topic: &Topic, handler: MessageHandler) -> AppResult<()> {
        self.connect().await?;
        let mut handlers = self.inner.handlers.lock().await;
        let existing = handlers.get(topic.as_str()).filter(|set| !set.is_empty());
        match existing {
            Some(set) if set.contains(&handler) => return Ok(()),
            Some(_) => {}
            None => {
                let transport = self.inner.transport().await.ok_or_else(|| {
                    AppError::Subscription(format!("not connected while subscribing to {}", topic))
                })?;
                transport.subscribe(topic.as_str()).await?;
                debug!("wire subscription added");
            }
        }
        handlers
            .entry(topic.as_str().to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Remove `handler`. The wire subscription goes when the topic has no handlers left.
    /// While not connected only the local set changes.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn unsubscribe(&self, topic: &Topic, handler: &MessageHandler) -> AppResult<()> {
        let mut handlers = self.inner.handlers.lock().await;
        let Some(set) = handlers.get_mut(topic.as_str()) else {
            return Ok(());
        };
        set.retain(|h| h != handler);
        if !set.is_empty() {
            return Ok(());
        }
        handlers.remove(topic.as_str());

        if self.state() != ConnectionState::Connected {
            debug!("not connected, skipping wire unsubscribe");
            return Ok(());
        }
        if let Some(transport) = self.inner.transport().await {
            transport.unsubscribe(topic.as_str()).await?;
            debug!("wire subscription removed");
        }
        Ok(())
    }

    /// Serialize `message` as JSON and publish it. Failures are returned, never retried.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &Topic, message: &T) -> AppResult<()> {
        self.connect().await?;
        let payload = serde_json::to_string(message)?;
        let transport = self.inner.transport().await.ok_or_else(|| {
            AppError::Publish(format!("not connected while publishing to {}", topic))
        })?;
        transport.publish(topic.as_str(), &payload).await?;
        debug!(bytes = payload.len(), "published");
        Ok(())
    }

    /// End the connection and forget every handler. The next `connect` starts fresh.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _attempt = self.inner.attempt.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let link = self.inner.link.write().await.take();
        if let Some(link) = link {
            link.transport.end().await;
        }
        self.inner.handlers.lock().await.clear();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        let _ = self.inner.events.send(ConnectionEvent::Closed);
        info!("disconnected");
    }
}

impl Inner {
    fn target(&self) -> AppResult<(String, String)> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AppError::Configuration("realtime endpoint is not set".to_string()))?;
        let credential = self
            .config
            .credential
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Configuration("realtime credential is not set".to_string()))?;
        Ok((
            broker_url(endpoint, &self.config.authorizer_name),
            credential.to_string(),
        ))
    }

    async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.link.read().await.as_ref().map(|l| l.transport.clone())
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = error;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait until the state leaves `Connecting`.
    async fn settled(&self, rx: &mut watch::Receiver<ConnectionState>) -> AppResult<()> {
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let reason = self
                        .last_error()
                        .unwrap_or_else(|| "connection closed".to_string());
                    return Err(AppError::Connection(reason));
                }
                ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(AppError::Connection("connection manager dropped".to_string()));
            }
        }
    }

    /// Drop an attempt that never connected, unless a newer one replaced it.
    async fn abandon(&self, generation: u64, reason: &str) {
        let _attempt = self.attempt.lock().await;
        if !self.is_current(generation)
            || self.connected_generation.load(Ordering::SeqCst) == generation
            || *self.state.borrow() != ConnectionState::Connecting
        {
            return;
        }
        warn!(generation, reason, "abandoning connect attempt");
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.write().await.take() {
            link.transport.end().await;
        }
        self.set_last_error(Some(reason.to_string()));
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Re-issue wire subscriptions for handlers that outlived their transport.
    async fn restore_subscriptions(&self, generation: u64) {
        let Some(transport) = self
            .link
            .read()
            .await
            .as_ref()
            .filter(|l| l.generation == generation)
            .map(|l| l.transport.clone())
        else {
            return;
        };
        let handlers = self.handlers.lock().await;
        for topic in handlers.keys() {
            if let Err(e) = transport.subscribe(topic).await {
                warn!(topic = %topic, error = %e, "could not restore subscription");
            }
        }
    }

    async fn dispatch(&self, topic: &str, payload: &str) {
        let handlers = self
            .handlers
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(topic = %topic, "message with no handlers");
            return;
        }
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(payload))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(topic = %topic, handler = index, panic = %reason, "message handler panicked");
            }
        }
    }
}

/// Gives up on attempt `generation` if it has not connected within `deadline`.
async fn connect_deadline(inner: Weak<Inner>, generation: u64, deadline: Duration) {
    tokio::time::sleep(deadline).await;
    if let Some(inner) = inner.upgrade() {
        inner
            .abandon(generation, &format!("connect timed out after {:?}", deadline))
            .await;
    }
}

/// Applies one transport's events to the manager until the transport goes away.
async fn run_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>, generation: u64) {
    let mut first_connect = true;
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_current(generation) {
            debug!(generation, "dropping event from a replaced transport");
            continue;
        }
        match event {
            TransportEvent::Connected => {
                if first_connect {
                    inner.restore_subscriptions(generation).await;
                    first_connect = false;
                }
                inner.connected_generation.store(generation, Ordering::SeqCst);
                inner.set_last_error(None);
                inner.state.send_replace(ConnectionState::Connected);
                info!(generation, "connected");
                let _ = inner.events.send(ConnectionEvent::Connected);
            }
            TransportEvent::Message { topic, payload } => {
                inner.dispatch(&topic, &payload).await;
            }
            TransportEvent::Reconnecting => {
                inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Connecting;
                        true
                    } else {
                        false
                    }
                });
                warn!(generation, "transport reconnecting");
                let _ = inner.events.send(ConnectionEvent::Reconnecting);
            }
            TransportEvent::Error(reason) => {
                warn!(generation, error = %reason, "transport error");
                inner.set_last_error(Some(reason.clone()));
                inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                let _ = inner.events.send(ConnectionEvent::Error(reason));
            }
            TransportEvent::Closed => {
                inner.state.send_replace(ConnectionState::Disconnected);
                let _ = inner.events.send(ConnectionEvent::Closed);
            }
        }
    }
    debug!(generation, "transport event stream ended");
}
