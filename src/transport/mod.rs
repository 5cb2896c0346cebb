//! Transport seam: the narrow interface the connection manager drives.
//!
//! A [`TransportFactory`] opens a connection and reports lifecycle and inbound
//! messages as [`TransportEvent`]s on the channel it is handed. Reconnect and
//! backoff belong to the transport.

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryBroker, WireOp};
pub use mqtt::MqttTransportFactory;

use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// MQTT protocol version requested from the broker.
pub const PROTOCOL_VERSION: u8 = 5;

/// Events a transport reports for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message { topic: String, payload: String },
    /// Link lost; the transport is retrying on its own schedule.
    Reconnecting,
    Error(String),
    Closed,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Options handed to the factory for each connection attempt.
#[derive(Clone)]
pub struct TransportOptions {
    pub protocol_version: u8,
    /// Left empty for custom-authorizer brokers.
    pub username: String,
    /// The credential.
    pub password: String,
    pub client_id: String,
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("protocol_version", &self.protocol_version)
            .field("client_id", &self.client_id)
            .field("reconnect_period", &self.reconnect_period)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// A client id in the `client_<random>` shape.
pub fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("client_{}", &id[..13])
}

/// Broker URL for a custom-authorizer WebSocket endpoint.
pub fn broker_url(endpoint: &str, authorizer_name: &str) -> String {
    format!(
        "wss://{}/mqtt?x-amz-customauthorizer-name={}",
        endpoint, authorizer_name
    )
}

/// One open connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Resolves once the broker acknowledges the subscription.
    async fn subscribe(&self, topic: &str) -> AppResult<()>;
    async fn unsubscribe(&self, topic: &str) -> AppResult<()>;
    /// Resolves once the broker accepts the message.
    async fn publish(&self, topic: &str, payload: &str) -> AppResult<()>;
    /// Close the connection. No further events are sent.
    async fn end(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Start connecting. Success is reported later as [`TransportEvent::Connected`].
    async fn open(
        &self,
        url: &str,
        options: TransportOptions,
        events: EventSender,
    ) -> AppResult<Arc<dyn Transport>>;
}
