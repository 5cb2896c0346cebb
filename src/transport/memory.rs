//! In-process broker: runs the topic authorizer at its connection gate,
//! enforces grants, fans messages out, and records wire-level operations.

use crate::error::{AppError, AppResult};
use crate::models::grant::PermissionGrant;
use crate::services::authorizer::TopicAuthorizer;
use crate::transport::{EventSender, Transport, TransportEvent, TransportFactory, TransportOptions};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A wire-level operation seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Connect { client_id: String },
    Subscribe { client_id: String, topic: String },
    Unsubscribe { client_id: String, topic: String },
    Publish { client_id: String, topic: String },
    Disconnect { client_id: String },
}

struct Session {
    credential: String,
    grant: PermissionGrant,
    events: EventSender,
    topics: HashSet<String>,
    connected: Arc<AtomicBool>,
}

struct BrokerInner {
    authorizer: TopicAuthorizer,
    app_name: String,
    stage: String,
    sessions: Mutex<HashMap<String, Session>>,
    log: Mutex<Vec<WireOp>>,
    refuse: AtomicBool,
    connect_delay_ms: AtomicU64,
    opened: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(authorizer: TopicAuthorizer, app_name: &str, stage: &str) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                authorizer,
                app_name: app_name.to_string(),
                stage: stage.to_string(),
                sessions: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                connect_delay_ms: AtomicU64::new(0),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Reject every new connection at the gate.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hold each connection attempt at the gate for `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Connection attempts the broker has seen.
    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub async fn wire_log(&self) -> Vec<WireOp> {
        self.inner.log.lock().await.clone()
    }

    pub async fn subscribe_count(&self, topic: &str) -> usize {
        self.wire_log()
            .await
            .iter()
            .filter(|op| matches!(op, WireOp::Subscribe { topic: t, .. } if t == topic))
            .count()
    }

    pub async fn unsubscribe_count(&self, topic: &str) -> usize {
        self.wire_log()
            .await
            .iter()
            .filter(|op| matches!(op, WireOp::Unsubscribe { topic: t, .. } if t == topic))
            .count()
    }

    /// Deliver a raw payload to every subscriber of `topic`, bypassing grants.
    pub async fn deliver_raw(&self, topic: &str, payload: &str) -> usize {
        self.inner.fan_out(topic, payload).await
    }

    /// Drop and restore every link. Credentials are re-evaluated on the way back.
    pub async fn simulate_reconnect(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        for (client_id, session) in sessions.iter_mut() {
            session.connected.store(false, Ordering::SeqCst);
            let _ = session.events.send(TransportEvent::Reconnecting);
            session.grant = self
                .inner
                .authorizer
                .authorize(&session.credential, &self.inner.app_name, &self.inner.stage)
                .await;
            session.connected.store(true, Ordering::SeqCst);
            let _ = session.events.send(TransportEvent::Connected);
            debug!(client_id = %client_id, "client reconnected");
        }
    }
}

impl BrokerInner {
    async fn record(&self, op: WireOp) {
        self.log.lock().await.push(op);
    }

    async fn fan_out(&self, topic: &str, payload: &str) -> usize {
        let sessions = self.sessions.lock().await;
        let mut delivered = 0;
        for session in sessions.values().filter(|s| s.topics.contains(topic)) {
            let event = TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            };
            if session.events.send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn admit(
        self: Arc<Self>,
        client_id: String,
        options: TransportOptions,
        events: EventSender,
        connected: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    ) {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Error("connection refused".to_string()));
            return;
        }

        let grant = self
            .authorizer
            .authorize(&options.password, &self.app_name, &self.stage)
            .await;
        {
            let mut sessions = self.sessions.lock().await;
            // `end` sets the flag before taking this lock.
            if closed.load(Ordering::SeqCst) {
                debug!(client_id = %client_id, "connection ended before admission");
                return;
            }
            sessions.insert(
                client_id.clone(),
                Session {
                    credential: options.password,
                    grant,
                    events: events.clone(),
                    topics: HashSet::new(),
                    connected: connected.clone(),
                },
            );
            self.record(WireOp::Connect {
                client_id: client_id.clone(),
            })
            .await;
        }
        connected.store(true, Ordering::SeqCst);
        info!(client_id = %client_id, "client admitted");
        let _ = events.send(TransportEvent::Connected);
    }
}

#[async_trait]
impl TransportFactory for MemoryBroker {
    async fn open(
        &self,
        _url: &str,
        options: TransportOptions,
        events: EventSender,
    ) -> AppResult<Arc<dyn Transport>> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let connected = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let client_id = options.client_id.clone();
        tokio::spawn(self.inner.clone().admit(
            client_id.clone(),
            options,
            events,
            connected.clone(),
            closed.clone(),
        ));
        Ok(Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            client_id,
            connected,
            closed,
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    client_id: String,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &str) -> AppResult<()> {
        {
            let mut sessions = self.broker.sessions.lock().await;
            let session = sessions
                .get_mut(&self.client_id)
                .ok_or_else(|| AppError::Subscription("not connected".to_string()))?;
            if !session.grant.allows_subscribe(topic) {
                return Err(AppError::Subscription(format!("not authorized to subscribe to {}", topic)));
            }
            session.topics.insert(topic.to_string());
        }
        self.broker
            .record(WireOp::Subscribe {
                client_id: self.client_id.clone(),
                topic: topic.to_string(),
            })
            .await;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> AppResult<()> {
        {
            let mut sessions = self.broker.sessions.lock().await;
            if let Some(session) = sessions.get_mut(&self.client_id) {
                session.topics.remove(topic);
            }
        }
        self.broker
            .record(WireOp::Unsubscribe {
                client_id: self.client_id.clone(),
                topic: topic.to_string(),
            })
            .await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> AppResult<()> {
        {
            let sessions = self.broker.sessions.lock().await;
            let session = sessions
                .get(&self.client_id)
                .ok_or_else(|| AppError::Publish("not connected".to_string()))?;
            if !session.grant.allows_publish(topic) {
                return Err(AppError::Publish(format!("not authorized to publish to {}", topic)));
            }
        }
        self.broker
            .record(WireOp::Publish {
                client_id: self.client_id.clone(),
                topic: topic.to_string(),
            })
            .await;
        self.broker.fan_out(topic, payload).await;
        Ok(())
    }

    async fn end(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let removed = self.broker.sessions.lock().await.remove(&self.client_id);
        if removed.is_some() {
            self.broker
                .record(WireOp::Disconnect {
                    client_id: self.client_id.clone(),
                })
                .await;
        }
    }
}
