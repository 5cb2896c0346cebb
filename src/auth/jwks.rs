//! JWKS retrieval and caching with rotation-aware refresh.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Where signing keys come from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch(&self) -> AppResult<JwkSet>;
}

/// Key set published over HTTPS (`/.well-known/jwks.json`).
pub struct HttpKeySet {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySet {
    pub fn new(url: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySet {
    async fn fetch(&self) -> AppResult<JwkSet> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Jwt(format!("jwks fetch from {}: {}", self.url, e)))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AppError::Jwt(format!("jwks decode: {}", e)))
    }
}

/// Fixed key set, for pinned keys and tests.
pub struct StaticKeySet(pub JwkSet);

#[async_trait]
impl KeySetSource for StaticKeySet {
    async fn fetch(&self) -> AppResult<JwkSet> {
        Ok(self.0.clone())
    }
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Caches a key set for `ttl`. A lookup that misses (unknown `kid`) or finds
/// the cache expired refetches, at most once per `cooldown`. Fetch failures
/// keep whatever keys were cached before.
pub struct JwksCache {
    source: Arc<dyn KeySetSource>,
    cached: RwLock<Option<CachedKeys>>,
    last_attempt: Mutex<Option<Instant>>,
    ttl: Duration,
    cooldown: Duration,
}

impl JwksCache {
    pub fn new(source: Arc<dyn KeySetSource>, ttl: Duration, cooldown: Duration) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            last_attempt: Mutex::new(None),
            ttl,
            cooldown,
        }
    }

    /// Key for a token's `kid`; with no `kid`, the first published key.
    pub async fn key_for(&self, kid: Option<&str>) -> Option<Jwk> {
        if let Some(jwk) = self.lookup(kid, true).await {
            return Some(jwk);
        }
        self.refresh().await;
        self.lookup(kid, false).await
    }

    async fn lookup(&self, kid: Option<&str>, require_fresh: bool) -> Option<Jwk> {
        let cached = self.cached.read().await;
        let entry = cached.as_ref()?;
        if require_fresh && entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        match kid {
            Some(kid) => entry.keys.find(kid).cloned(),
            None => entry.keys.keys.first().cloned(),
        }
    }

    async fn refresh(&self) {
        let mut last = self.last_attempt.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.cooldown {
                debug!("jwks refresh skipped during cooldown");
                return;
            }
        }
        *last = Some(Instant::now());

        match self.source.fetch().await {
            Ok(keys) => {
                info!(count = keys.keys.len(), "jwks refreshed");
                *self.cached.write().await = Some(CachedKeys {
                    keys,
                    fetched_at: Instant::now(),
                });
            }
            Err(e) => warn!(error = %e, "jwks fetch failed; keeping cached keys"),
        }
    }
}
