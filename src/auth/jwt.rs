//! Administrator token validation against a published key set.

use crate::auth::jwks::JwksCache;
use crate::error::{AppError, AppResult};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies administrator JWTs. Issuer and audience are checked only when configured.
pub struct TokenVerifier {
    jwks: JwksCache,
    issuer: Option<String>,
    audience: Option<String>,
}

impl TokenVerifier {
    pub fn new(jwks: JwksCache, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            jwks,
            issuer,
            audience,
        }
    }

    pub async fn validate(&self, token: &str) -> AppResult<Claims> {
        let header = decode_header(token).map_err(|e| AppError::Jwt(e.to_string()))?;
        let jwk = self
            .jwks
            .key_for(header.kid.as_deref())
            .await
            .ok_or_else(|| AppError::Jwt("no matching signing key".to_string()))?;

        // A key that declares its algorithm only verifies tokens signed with it.
        if let Some(declared) = jwk.common.key_algorithm {
            if format!("{:?}", declared) != format!("{:?}", header.alg) {
                return Err(AppError::Jwt(format!(
                    "token algorithm {:?} does not match key algorithm {:?}",
                    header.alg, declared
                )));
            }
        }

        let key = DecodingKey::from_jwk(&jwk).map_err(|e| AppError::Jwt(e.to_string()))?;
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| AppError::Jwt(e.to_string()))?;
        Ok(data.claims)
    }
}
