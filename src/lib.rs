//! Realtime audience demo over a permission-gated publish/subscribe broker.
//!
//! An operator drives the shared demo mode; audience devices follow it over
//! MQTT topics whose publish rights are granted per credential tier.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;
pub mod transport;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use handlers::http::AppState;
pub use services::{ConnectionManager, ConnectionRegistry, DemoController, DemoSession, TopicAuthorizer};

use axum::routing::{get, post};
use handlers::http;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the API router (health, authorizer hook, control). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(http::health))
        .route("/authorize", post(http::authorize))
        .route("/api/control", post(http::control))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
