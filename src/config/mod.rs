//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:3000`).
    pub server_addr: SocketAddr,
    /// Redis connection URL (e.g. `redis://127.0.0.1/`).
    pub redis_url: String,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Topic authorizer settings (secrets, JWKS).
    pub authorizer: AuthorizerConfig,
    /// Realtime connection identity used by this process.
    pub realtime: RealtimeConfig,
}

/// Settings for the tiered topic authorizer.
#[derive(Clone, Default)]
pub struct AuthorizerConfig {
    /// Base URL of the token issuer; JWKS is read from `{auth_url}/.well-known/jwks.json`.
    pub auth_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    /// How long a fetched key set is trusted before refetching.
    pub jwks_cache_ttl: Duration,
    /// Minimum spacing between refetches triggered by an unknown `kid`.
    pub jwks_cooldown: Duration,
    /// Shared secret granting the participant tier.
    pub write_token: Option<String>,
    /// Shared secret granting the viewer tier.
    pub read_only_token: Option<String>,
}

impl AuthorizerConfig {
    pub fn jwks_url(&self) -> Option<String> {
        self.auth_url
            .as_ref()
            .map(|url| format!("{}/.well-known/jwks.json", url.trim_end_matches('/')))
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for AuthorizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizerConfig")
            .field("auth_url", &self.auth_url)
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("jwks_cooldown", &self.jwks_cooldown)
            .field("write_token", &self.write_token.as_ref().map(|_| "<set>"))
            .field("read_only_token", &self.read_only_token.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Connection identity: application, stage, broker endpoint and the credential presented.
#[derive(Clone)]
pub struct RealtimeConfig {
    pub app_name: String,
    pub stage: String,
    /// Broker host, without scheme (e.g. `abc123-ats.iot.eu-west-1.amazonaws.com`).
    pub endpoint: Option<String>,
    pub authorizer_name: String,
    /// Credential presented as the connection password.
    pub credential: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
}

impl RealtimeConfig {
    pub fn new(app_name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            stage: stage.into(),
            endpoint: None,
            authorizer_name: DEFAULT_AUTHORIZER_NAME.to_string(),
            credential: None,
            connect_timeout: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(5),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("app_name", &self.app_name)
            .field("stage", &self.stage)
            .field("endpoint", &self.endpoint)
            .field("authorizer_name", &self.authorizer_name)
            .field("credential", &self.credential.as_ref().map(|_| "<set>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_period", &self.reconnect_period)
            .finish()
    }
}

const DEFAULT_AUTHORIZER_NAME: &str = "stagecast-authorizer";

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigLoadError> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigLoadError::InvalidNumber(name)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let authorizer = AuthorizerConfig {
            auth_url: optional_var("AUTH_URL"),
            jwt_issuer: optional_var("JWT_ISSUER"),
            jwt_audience: optional_var("JWT_AUDIENCE"),
            jwks_cache_ttl: secs_var("JWKS_CACHE_SECS", 600)?,
            jwks_cooldown: secs_var("JWKS_COOLDOWN_SECS", 30)?,
            write_token: optional_var("REALTIME_WRITE_TOKEN"),
            read_only_token: optional_var("REALTIME_READ_ONLY_TOKEN"),
        };

        let realtime = RealtimeConfig {
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "stagecast".to_string()),
            stage: std::env::var("STAGE").unwrap_or_else(|_| "dev".to_string()),
            endpoint: optional_var("REALTIME_ENDPOINT"),
            authorizer_name: std::env::var("REALTIME_AUTHORIZER_NAME")
                .unwrap_or_else(|_| DEFAULT_AUTHORIZER_NAME.to_string()),
            credential: optional_var("REALTIME_TOKEN"),
            connect_timeout: secs_var("CONNECT_TIMEOUT_SECS", 30)?,
            reconnect_period: secs_var("RECONNECT_PERIOD_SECS", 5)?,
        };

        Ok(Self {
            server_addr,
            redis_url,
            log_level,
            authorizer,
            realtime,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}
