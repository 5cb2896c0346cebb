//! Process-wide set of connection managers, one per identity, passed by handle.

use crate::config::RealtimeConfig;
use crate::services::connection::ConnectionManager;
use crate::transport::TransportFactory;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Owns every [`ConnectionManager`] in the process. Clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    managers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

/// `app/stage` plus a fingerprint of the credential, so identities never share a connection.
fn identity_key(config: &RealtimeConfig) -> String {
    let fingerprint = config
        .credential
        .as_deref()
        .map(|c| hex::encode(&Sha256::digest(c.as_bytes())[..8]))
        .unwrap_or_else(|| "anonymous".to_string());
    format!("{}/{}#{}", config.app_name, config.stage, fingerprint)
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            managers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The shared manager for this identity, created on first use. Does not connect.
    pub async fn manager_for(&self, config: &RealtimeConfig) -> ConnectionManager {
        let key = identity_key(config);
        let mut managers = self.managers.lock().await;
        managers
            .entry(key)
            .or_insert_with(|| ConnectionManager::new(config.clone(), self.factory.clone()))
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect and forget every manager.
    pub async fn shutdown(&self) {
        let managers: Vec<ConnectionManager> = {
            let mut map = self.managers.lock().await;
            map.drain().map(|(_, m)| m).collect()
        };
        let count = managers.len();
        futures::future::join_all(managers.iter().map(|m| m.disconnect())).await;
        info!(count, "connection registry shut down");
    }
}
