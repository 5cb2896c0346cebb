//! MQTT 5 over secure WebSocket, backed by rumqttc.
//!
//! rumqttc hands out packet ids only when a request leaves its queue, so
//! requests are serialized through `request_order` and matched to their
//! acknowledgment by the order of `Outgoing` events.

use crate::error::{AppError, AppResult};
use crate::transport::{
    EventSender, Transport, TransportEvent, TransportFactory, TransportOptions, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PubAckReason, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WSS_PORT: u16 = 443;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Waiter = Option<oneshot::Sender<AppResult<()>>>;

/// Waiters for one request type: queued until a packet id is assigned, then in flight.
#[derive(Default)]
struct Pending {
    queued: VecDeque<Waiter>,
    inflight: HashMap<u16, Waiter>,
}

impl Pending {
    fn assign(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn resolve(&mut self, pkid: u16, result: AppResult<()>) {
        if let Some(Some(tx)) = self.inflight.remove(&pkid) {
            let _ = tx.send(result);
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> AppError) {
        let waiters = self.queued.drain(..).chain(self.inflight.drain().map(|(_, w)| w));
        for tx in waiters.flatten() {
            let _ = tx.send(Err(error()));
        }
    }
}

#[derive(Default)]
struct Acks {
    subscribe: Pending,
    unsubscribe: Pending,
    publish: Pending,
}

struct Shared {
    client: AsyncClient,
    acks: Mutex<Acks>,
    request_order: tokio::sync::Mutex<()>,
    active_topics: Mutex<HashSet<String>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn acks(&self) -> std::sync::MutexGuard<'_, Acks> {
        self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail_pending(&self, reason: &str) {
        let mut acks = self.acks();
        acks.subscribe
            .fail_all(|| AppError::Subscription(format!("connection lost: {}", reason)));
        acks.unsubscribe
            .fail_all(|| AppError::Subscription(format!("connection lost: {}", reason)));
        acks.publish
            .fail_all(|| AppError::Publish(format!("connection lost: {}", reason)));
    }

    /// Re-issue every active subscription after the transport reconnects.
    fn restore_subscriptions(self: Arc<Self>) {
        let topics: Vec<String> = self
            .active_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        tokio::spawn(async move {
            for topic in topics {
                let _order = self.request_order.lock().await;
                self.acks().subscribe.queued.push_back(None);
                if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                    self.acks().subscribe.queued.pop_back();
                    warn!(topic = %topic, error = %e, "resubscribe failed");
                }
            }
        });
    }
}

/// Opens rumqttc connections.
#[derive(Clone, Default)]
pub struct MqttTransportFactory;

#[async_trait]
impl TransportFactory for MqttTransportFactory {
    async fn open(
        &self,
        url: &str,
        options: TransportOptions,
        events: EventSender,
    ) -> AppResult<Arc<dyn Transport>> {
        if options.protocol_version != PROTOCOL_VERSION {
            warn!(
                requested = options.protocol_version,
                "only MQTT 5 is supported; connecting with MQTT 5"
            );
        }

        let mut mqtt = MqttOptions::new(options.client_id.clone(), url, WSS_PORT);
        mqtt.set_keep_alive(KEEP_ALIVE);
        mqtt.set_credentials(options.username.clone(), options.password.clone());
        mqtt.set_transport(rumqttc::Transport::wss_with_default_config());

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let shared = Arc::new(Shared {
            client,
            acks: Mutex::new(Acks::default()),
            request_order: tokio::sync::Mutex::new(()),
            active_topics: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        info!(client_id = %options.client_id, "opening mqtt connection");
        let driver = tokio::spawn(drive(
            eventloop,
            shared.clone(),
            events,
            options.reconnect_period,
        ));

        Ok(Arc::new(MqttConnection {
            shared,
            driver: Mutex::new(Some(driver)),
        }))
    }
}

async fn drive(mut eventloop: EventLoop, shared: Arc<Shared>, events: EventSender, reconnect_period: Duration) {
    let mut was_connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let _ = events.send(TransportEvent::Error(format!(
                        "connection rejected: {:?}",
                        ack.code
                    )));
                    continue;
                }
                shared.connected.store(true, Ordering::SeqCst);
                if was_connected {
                    shared.clone().restore_subscriptions();
                }
                was_connected = true;
                let _ = events.send(TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => {
                        let _ = events.send(TransportEvent::Message { topic, payload });
                    }
                    Err(_) => warn!(topic = %topic, "dropping non UTF-8 payload"),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let accepted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                let result = if accepted {
                    Ok(())
                } else {
                    Err(AppError::Subscription(format!(
                        "broker rejected subscription: {:?}",
                        ack.return_codes
                    )))
                };
                shared.acks().subscribe.resolve(ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                shared.acks().unsubscribe.resolve(ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let result = match ack.reason {
                    PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
                    other => Err(AppError::Publish(format!("broker rejected publish: {:?}", other))),
                };
                shared.acks().publish.resolve(ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::Disconnect(packet))) => {
                warn!(?packet, "broker sent disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.acks().subscribe.assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.acks().unsubscribe.assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.acks().publish.assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if shared.closing.load(Ordering::SeqCst) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                shared.fail_pending(&e.to_string());
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "mqtt connection error");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                let _ = events.send(TransportEvent::Reconnecting);
                tokio::time::sleep(reconnect_period).await;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    debug!("mqtt event loop stopped");
    let _ = events.send(TransportEvent::Closed);
}

struct MqttConnection {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Queue a waiter and hand the request to rumqttc in one ordered step.
    async fn request<F, Fut>(&self, pick: fn(&mut Acks) -> &mut Pending, send: F) -> AppResult<oneshot::Receiver<AppResult<()>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), rumqttc::v5::ClientError>>,
    {
        let (tx, rx) = oneshot::channel();
        let _order = self.shared.request_order.lock().await;
        pick(&mut self.shared.acks()).queued.push_back(Some(tx));
        if let Err(e) = send().await {
            pick(&mut self.shared.acks()).queued.pop_back();
            return Err(AppError::Connection(format!("mqtt client: {}", e)));
        }
        Ok(rx)
    }
}

async fn acknowledged(rx: oneshot::Receiver<AppResult<()>>, dropped: impl Fn() -> AppError) -> AppResult<()> {
    rx.await.unwrap_or_else(|_| Err(dropped()))
}

#[async_trait]
impl Transport for MqttConnection {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &str) -> AppResult<()> {
        let client = &self.shared.client;
        let rx = self
            .request(|a| &mut a.subscribe, || client.subscribe(topic.to_string(), QoS::AtMostOnce))
            .await
            .map_err(|e| AppError::Subscription(e.to_string()))?;
        acknowledged(rx, || AppError::Subscription("acknowledgment dropped".to_string())).await?;
        self.shared
            .active_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> AppResult<()> {
        self.shared
            .active_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(topic);
        let client = &self.shared.client;
        let rx = self
            .request(|a| &mut a.unsubscribe, || client.unsubscribe(topic.to_string()))
            .await
            .map_err(|e| AppError::Subscription(e.to_string()))?;
        acknowledged(rx, || AppError::Subscription("acknowledgment dropped".to_string())).await
    }

    async fn publish(&self, topic: &str, payload: &str) -> AppResult<()> {
        let client = &self.shared.client;
        let bytes = payload.as_bytes().to_vec();
        let rx = self
            .request(|a| &mut a.publish, || {
                client.publish(topic.to_string(), QoS::AtLeastOnce, false, bytes)
            })
            .await
            .map_err(|e| AppError::Publish(e.to_string()))?;
        acknowledged(rx, || AppError::Publish("acknowledgment dropped".to_string())).await
    }

    async fn end(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.client.disconnect().await {
            debug!(error = %e, "disconnect request not sent");
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.shared.fail_pending("connection closed");
    }
}
