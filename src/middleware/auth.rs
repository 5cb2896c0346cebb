//! Auth extractor: the bearer credential must resolve to the administrator tier.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use tracing::debug;

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::grant::Tier;

/// Extractor: request carries an administrator credential (`Authorization: Bearer <jwt>`).
#[derive(Clone, Copy, Debug)]
pub struct AdminUser;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Auth("Missing or invalid Authorization header".to_string()))?;

        match state.authorizer.classify(bearer.token()).await {
            Tier::Administrator => Ok(AdminUser),
            tier => {
                debug!(tier = ?tier, "rejected non-administrator credential");
                Err(AppError::Forbidden("administrator credential required".to_string()))
            }
        }
    }
}
