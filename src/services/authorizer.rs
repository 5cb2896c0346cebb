//! Tiered topic authorizer: maps a presented credential to a permission grant.

use crate::auth::{HttpKeySet, JwksCache, SharedSecret, TokenVerifier};
use crate::config::AuthorizerConfig;
use crate::error::AppResult;
use crate::models::grant::{PermissionGrant, Tier};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Resolves credentials to tiers, first match wins: administrator JWT, write
/// secret, read-only secret. Never fails; unknown credentials get the empty grant.
#[derive(Clone)]
pub struct TopicAuthorizer {
    verifier: Option<Arc<TokenVerifier>>,
    write_secret: Option<SharedSecret>,
    read_only_secret: Option<SharedSecret>,
}

impl TopicAuthorizer {
    pub fn new(
        verifier: Option<TokenVerifier>,
        write_secret: Option<&str>,
        read_only_secret: Option<&str>,
    ) -> Self {
        Self {
            verifier: verifier.map(Arc::new),
            write_secret: write_secret.and_then(SharedSecret::new),
            read_only_secret: read_only_secret.and_then(SharedSecret::new),
        }
    }

    /// Build from configuration; without `AUTH_URL` the administrator tier is disabled.
    pub fn from_config(config: &AuthorizerConfig) -> AppResult<Self> {
        let verifier = match config.jwks_url() {
            Some(url) => {
                info!(jwks = %url, "administrator tier enabled");
                let source = Arc::new(HttpKeySet::new(url)?);
                let jwks = JwksCache::new(source, config.jwks_cache_ttl, config.jwks_cooldown);
                Some(TokenVerifier::new(
                    jwks,
                    config.jwt_issuer.clone(),
                    config.jwt_audience.clone(),
                ))
            }
            None => None,
        };
        Ok(Self::new(
            verifier,
            config.write_token.as_deref(),
            config.read_only_token.as_deref(),
        ))
    }

    /// Tier a credential resolves to.
    pub async fn classify(&self, credential: &str) -> Tier {
        if let Some(verifier) = &self.verifier {
            match verifier.validate(credential).await {
                Ok(claims) => {
                    debug!(sub = %claims.sub, "administrator token accepted");
                    return Tier::Administrator;
                }
                Err(e) => debug!(error = %e, "not an administrator token"),
            }
        }
        if self.write_secret.as_ref().is_some_and(|s| s.matches(credential)) {
            return Tier::Participant;
        }
        if self.read_only_secret.as_ref().is_some_and(|s| s.matches(credential)) {
            return Tier::Viewer;
        }
        Tier::Unauthenticated
    }

    /// Grant for a credential within an application stage.
    #[instrument(skip(self, credential))]
    pub async fn authorize(&self, credential: &str, app_name: &str, stage: &str) -> PermissionGrant {
        let tier = self.classify(credential).await;
        info!(tier = ?tier, "connection authorized");
        PermissionGrant::for_tier(tier, app_name, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support;
    use crate::models::topic::wildcard;

    fn authorizer() -> TopicAuthorizer {
        TopicAuthorizer::new(Some(test_support::verifier()), Some("write-secret"), Some("read-secret"))
    }

    #[tokio::test]
    async fn admin_token_gets_wildcard_grant() {
        let grant = authorizer().authorize(&test_support::admin_token(), "demo", "dev").await;
        assert_eq!(grant.publish, vec![wildcard("demo", "dev")]);
        assert_eq!(grant.subscribe, vec![wildcard("demo", "dev")]);
    }

    #[tokio::test]
    async fn admin_token_wins_over_secret_with_same_value() {
        let token = test_support::admin_token();
        let authorizer = TopicAuthorizer::new(Some(test_support::verifier()), Some(&token), Some(&token));
        assert_eq!(authorizer.classify(&token).await, Tier::Administrator);
    }

    #[tokio::test]
    async fn write_secret_gets_participant_grant_without_control() {
        let grant = authorizer().authorize("write-secret", "demo", "dev").await;
        assert_eq!(grant, PermissionGrant::for_tier(Tier::Participant, "demo", "dev"));
        assert!(!grant.allows_publish("demo/dev/control"));
        assert!(grant.allows_subscribe("demo/dev/control"));
    }

    #[tokio::test]
    async fn read_only_secret_gets_viewer_grant() {
        let grant = authorizer().authorize("read-secret", "demo", "dev").await;
        assert_eq!(grant.publish, vec!["demo/dev/_readonly_dummy".to_string()]);
        assert_eq!(grant.subscribe, vec![wildcard("demo", "dev")]);
    }

    #[tokio::test]
    async fn anything_else_gets_empty_grant() {
        let authorizer = authorizer();
        for credential in ["", "nope", "write-secret-ish", "eyJhbGciOiJIUzI1NiJ9.e30.garbage"] {
            assert!(authorizer.authorize(credential, "demo", "dev").await.is_empty());
        }
    }

    #[tokio::test]
    async fn expired_admin_token_falls_through() {
        let token = test_support::sign(test_support::SIGNING_SECRET, chrono::Duration::hours(-2));
        assert_eq!(authorizer().classify(&token).await, Tier::Unauthenticated);
    }

    #[tokio::test]
    async fn unset_secrets_never_match() {
        let authorizer = TopicAuthorizer::new(None, None, Some(""));
        assert_eq!(authorizer.classify("").await, Tier::Unauthenticated);
        assert_eq!(authorizer.classify("anything").await, Tier::Unauthenticated);
    }

    #[tokio::test]
    async fn every_credential_maps_to_one_of_four_grants() {
        let authorizer = authorizer();
        let known: Vec<_> = [Tier::Administrator, Tier::Participant, Tier::Viewer, Tier::Unauthenticated]
            .iter()
            .map(|t| PermissionGrant::for_tier(*t, "demo", "dev"))
            .collect();
        let admin = test_support::admin_token();
        for credential in [admin.as_str(), "write-secret", "read-secret", "x", ""] {
            let grant = authorizer.authorize(credential, "demo", "dev").await;
            assert!(known.contains(&grant));
        }
    }
}
