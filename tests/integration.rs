//! Integration tests: HTTP surface and end-to-end demo flows over the in-memory broker.
//!
//! Run with `cargo test`. Nothing here needs Redis or a real broker.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use stagecast::auth::{Claims, JwksCache, StaticKeySet, TokenVerifier};
use stagecast::config::RealtimeConfig;
use stagecast::models::{topic_for, ChatMessage, ControlAction, ControlMessage, DemoMode, TopicKind};
use stagecast::repositories::MemoryDemoStore;
use stagecast::transport::MemoryBroker;
use stagecast::{create_app, AppError, AppState, ConnectionManager, DemoController, DemoSession, TopicAuthorizer};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const APP: &str = "demo";
const STAGE: &str = "test";
const WRITE_SECRET: &str = "participant-secret";
const READ_SECRET: &str = "viewer-secret";
const KID: &str = "integration-key";
const SIGNING_SECRET: &[u8] = b"integration-signing-secret-000000";

fn admin_token() -> String {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: "operator".to_string(),
        exp: (now + chrono::Duration::hours(1)).timestamp(),
        iat: Some(now.timestamp()),
        iss: None,
    };
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SIGNING_SECRET)).unwrap()
}

fn authorizer() -> TopicAuthorizer {
    let k = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(SIGNING_SECRET);
    let keys: JwkSet = serde_json::from_value(serde_json::json!({
        "keys": [{ "kty": "oct", "kid": KID, "alg": "HS256", "k": k }]
    }))
    .unwrap();
    let jwks = JwksCache::new(
        Arc::new(StaticKeySet(keys)),
        Duration::from_secs(600),
        Duration::from_secs(30),
    );
    TopicAuthorizer::new(
        Some(TokenVerifier::new(jwks, None, None)),
        Some(WRITE_SECRET),
        Some(READ_SECRET),
    )
}

struct Harness {
    broker: MemoryBroker,
    store: MemoryDemoStore,
    app: axum::Router,
}

impl Harness {
    async fn new() -> Self {
        let authorizer = authorizer();
        let broker = MemoryBroker::new(authorizer.clone(), APP, STAGE);
        let store = MemoryDemoStore::new();
        let controller = DemoController::new(connect_as(&broker, &admin_token()), Arc::new(store.clone())).await;
        let app = create_app(AppState {
            authorizer,
            controller,
            app_name: APP.to_string(),
            stage: STAGE.to_string(),
        });
        Self { broker, store, app }
    }

    fn manager(&self, credential: &str) -> ConnectionManager {
        connect_as(&self.broker, credential)
    }
}

fn connect_as(broker: &MemoryBroker, credential: &str) -> ConnectionManager {
    let config = RealtimeConfig::new(APP, STAGE)
        .with_endpoint("broker.test")
        .with_credential(credential)
        .with_connect_timeout(Duration::from_secs(2));
    ConnectionManager::new(config, Arc::new(broker.clone()))
}

fn json_post(uri: &str, body: serde_json::Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(res: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let harness = Harness::new().await;
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let res = harness.app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("ok"));
}

#[tokio::test]
async fn authorize_reports_each_tier() {
    let harness = Harness::new().await;
    let prefix = format!("{}/{}", APP, STAGE);
    let cases = [
        (admin_token(), "administrator", vec![format!("{}/*", prefix)]),
        (WRITE_SECRET.to_string(), "participant", vec![format!("{}/chat", prefix), format!("{}/vote", prefix)]),
        (READ_SECRET.to_string(), "viewer", vec![format!("{}/_readonly_dummy", prefix)]),
        ("guess".to_string(), "unauthenticated", vec![]),
    ];

    for (token, tier, publish) in cases {
        let req = json_post("/authorize", serde_json::json!({ "token": token }), None);
        let res = harness.app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["tier"], tier);
        assert_eq!(json["publish"], serde_json::json!(publish));
    }
}

#[tokio::test]
async fn control_requires_an_administrator() {
    let harness = Harness::new().await;
    let body = serde_json::json!({ "action": "enable_chat" });

    let res = harness.app.clone().oneshot(json_post("/api/control", body.clone(), None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = harness
        .app
        .clone()
        .oneshot(json_post("/api/control", body.clone(), Some(WRITE_SECRET)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.broker.connections_opened(), 0);

    let res = harness
        .app
        .oneshot(json_post("/api/control", body, Some(&admin_token())))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["mode"], "chat");
    assert_eq!(json["label"], "Live Chat");
}

#[tokio::test]
async fn control_rejects_unknown_actions() {
    let harness = Harness::new().await;
    let res = harness
        .app
        .oneshot(json_post(
            "/api/control",
            serde_json::json!({ "action": "self_destruct" }),
            Some(&admin_token()),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

/// Fresh audiences start in the waiting room and follow the operator into chat.
#[tokio::test]
async fn audiences_follow_the_operator() {
    let harness = Harness::new().await;
    let first = DemoSession::start(harness.manager(READ_SECRET), &harness.store, APP, STAGE)
        .await
        .unwrap();
    let second = DemoSession::start(harness.manager(WRITE_SECRET), &harness.store, APP, STAGE)
        .await
        .unwrap();
    assert_eq!(first.mode(), DemoMode::Waiting);
    assert_eq!(second.mode(), DemoMode::Waiting);
    let mut first_modes = first.watch_mode();
    let mut second_modes = second.watch_mode();

    let res = harness
        .app
        .clone()
        .oneshot(json_post(
            "/api/control",
            serde_json::json!({ "action": "enable_chat" }),
            Some(&admin_token()),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    for modes in [&mut first_modes, &mut second_modes] {
        tokio::time::timeout(Duration::from_secs(1), modes.wait_for(|m| *m == DemoMode::Chat))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(first.mode(), DemoMode::Chat);
    assert_eq!(second.mode(), DemoMode::Chat);

    // A late joiner bootstraps from the persisted snapshot.
    let late = DemoSession::start(harness.manager(READ_SECRET), &harness.store, APP, STAGE)
        .await
        .unwrap();
    assert_eq!(late.mode(), DemoMode::Chat);
}

#[tokio::test]
async fn participants_cannot_publish_control() {
    let harness = Harness::new().await;
    let participant = harness.manager(WRITE_SECRET);

    let control = topic_for(TopicKind::Control, APP, STAGE);
    let err = participant
        .publish(&control, &ControlMessage::new(ControlAction::EnableVote))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Publish(_)));

    let chat = topic_for(TopicKind::Chat, APP, STAGE);
    participant
        .publish(&chat, &ChatMessage::new("ana", "hello"))
        .await
        .unwrap();
}

#[tokio::test]
async fn chat_reaches_other_audiences_once() {
    let harness = Harness::new().await;
    let viewer = DemoSession::start(harness.manager(READ_SECRET), &harness.store, APP, STAGE)
        .await
        .unwrap();
    let participant = DemoController::new(harness.manager(WRITE_SECRET), Arc::new(harness.store.clone())).await;

    let sent = participant.send_chat("ana", "hello everyone").await.unwrap();
    let payload = serde_json::to_string(&sent).unwrap();
    harness
        .broker
        .deliver_raw(topic_for(TopicKind::Chat, APP, STAGE).as_str(), &payload)
        .await;

    tokio::time::timeout(Duration::from_secs(1), async {
        while viewer.chat().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Give the replayed copy time to land before checking for duplicates.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(viewer.chat(), vec![sent]);
}
