//! Entry point: load config, wire dependencies, and run the server.

use stagecast::config::Config;
use stagecast::repositories::RedisDemoStore;
use stagecast::transport::MqttTransportFactory;
use stagecast::{create_app, AppState, ConnectionRegistry, DemoController, TopicAuthorizer};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!(authorizer = ?config.authorizer, realtime = ?config.realtime, "configuration loaded");

    let authorizer = TopicAuthorizer::from_config(&config.authorizer)?;
    let realtime = &config.realtime;
    let store = Arc::new(RedisDemoStore::new(
        &config.redis_url,
        &realtime.app_name,
        &realtime.stage,
    )?);

    let registry = ConnectionRegistry::new(Arc::new(MqttTransportFactory));
    let manager = registry.manager_for(realtime).await;
    if realtime.endpoint.is_none() || realtime.credential.is_none() {
        tracing::warn!("REALTIME_ENDPOINT or REALTIME_TOKEN unset; control requests will fail until configured");
    }
    let controller = DemoController::new(manager, store).await;

    let state = AppState {
        authorizer,
        controller,
        app_name: realtime.app_name.clone(),
        stage: realtime.stage.clone(),
    };
    let app = create_app(state);

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.shutdown().await;
    Ok(())
}
