//! HTTP handlers: health, the broker's authorizer hook, and demo control.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::middleware::AdminUser;
use crate::models::grant::{PermissionGrant, Tier};
use crate::models::message::ControlAction;
use crate::services::{DemoController, TopicAuthorizer};

/// Shared application state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub authorizer: TopicAuthorizer,
    pub controller: DemoController,
    pub app_name: String,
    pub stage: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub tier: Tier,
    #[serde(flatten)]
    pub grant: PermissionGrant,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

/// POST /authorize: called by the broker's connection gate with the presented credential.
/// Always answers 200; unknown credentials get the empty grant.
pub async fn authorize(
    State(state): State<AppState>,
    Json(body): Json<AuthorizeRequest>,
) -> Json<AuthorizeResponse> {
    let tier = state.authorizer.classify(&body.token).await;
    let grant = PermissionGrant::for_tier(tier, &state.app_name, &state.stage);
    Json(AuthorizeResponse { tier, grant })
}

/// POST /api/control: change the demo mode for every audience. Administrator only.
pub async fn control(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<ControlRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mode = state.controller.trigger(body.action).await?;
    info!(mode = %mode, "control applied");
    Ok(Json(json!({
        "ok": true,
        "mode": mode,
        "label": mode.label(),
    })))
}

/// GET /health: liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "stagecast" })),
    )
}
