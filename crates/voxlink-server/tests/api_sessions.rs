use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tower::ServiceExt;
use voxlink_server::config::Config;
use voxlink_server::middleware::RateLimit;
use voxlink_server::{app, AppState};
use voxlink_voice::{LoopbackBackend, VoiceService};

fn state_with(config: &Config) -> AppState {
    let service = VoiceService::with_backend(Arc::new(LoopbackBackend::new(8)));
    AppState::new(service, config)
}

fn request(uri: &str, ip: [u8; 4]) -> Request<Body> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), 40000);
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn get(router: &Router, uri: &str, ip: [u8; 4]) -> axum::response::Response {
    router.clone().oneshot(request(uri, ip)).await.unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let router = app(state_with(&Config::default()));

    let response = get(&router, "/health", [127, 0, 0, 1]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn session_listing_reflects_the_registry() {
    let state = state_with(&Config::default());
    let router = app(state.clone());

    let json = body_json(get(&router, "/api/voice/sessions", [127, 0, 0, 1]).await).await;
    assert_eq!(json["count"], 0);

    let _lease = state.sessions.register("s1", "u1", "c1").unwrap();
    let json = body_json(get(&router, "/api/voice/sessions", [127, 0, 0, 1]).await).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["session_id"], "s1");
    assert_eq!(json["sessions"][0]["user_id"], "u1");
    assert!(json["sessions"][0]["started_at"].is_string());
}

#[tokio::test]
async fn session_listing_is_rate_limited_per_ip() {
    let mut config = Config::default();
    config.rate_limit.sessions_api = RateLimit::new(2, 60);
    let router = app(state_with(&config));

    for _ in 0..2 {
        let response = get(&router, "/api/voice/sessions", [10, 0, 0, 1]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = get(&router, "/api/voice/sessions", [10, 0, 0, 1]).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let json = body_json(response).await;
    assert_eq!(json["error"], "rate_limited");
    assert_eq!(json["message"], "Too many requests. Please try again later.");
    assert_eq!(json["retry_after_seconds"], retry_after);

    let response = get(&router, "/api/voice/sessions", [10, 0, 0, 2]).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_is_not_rate_limited() {
    let mut config = Config::default();
    config.rate_limit.sessions_api = RateLimit::new(1, 60);
    let router = app(state_with(&config));

    for _ in 0..5 {
        let response = get(&router, "/health", [10, 0, 0, 3]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
