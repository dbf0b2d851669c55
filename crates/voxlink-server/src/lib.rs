//! Voxlink server library logic.

pub mod api_voice;
pub mod config;
pub mod handshake;
pub mod middleware;
pub mod registry;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Json, Router};
use config::{Config, RateLimitConfig};
use middleware::{IdentityMode, RateLimitGuard, RateLimiter};
use registry::SessionRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use voxlink_voice::{VoiceError, VoiceService};

/// Rate limit scope for the session listing endpoint.
pub const LIST_SESSIONS_SCOPE: &str = "list_sessions";

/// Application state shared across all request handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Factory for per-connection voice sessions.
    pub voice_service: VoiceService,
    /// Active voice sessions by session id.
    pub sessions: SessionRegistry,
    /// Sliding-window counters shared by every guard.
    pub rate_limiter: RateLimiter,
    /// Rules applied by the guards.
    pub rate_limits: RateLimitConfig,
    /// How long to wait for a start message.
    pub handshake_timeout: Duration,
    /// Capacity of each connection's notice channel.
    pub notice_buffer: usize,
}

impl AppState {
    /// Builds state around an already constructed voice service.
    pub fn new(voice_service: VoiceService, config: &Config) -> Self {
        Self {
            voice_service,
            sessions: SessionRegistry::new(),
            rate_limiter: RateLimiter::new(),
            rate_limits: config.rate_limit.clone(),
            handshake_timeout: config.stream.handshake_timeout(),
            notice_buffer: config.stream.notice_buffer,
        }
    }

    /// Builds state with the speech backend selected by `config.voice`.
    pub fn from_config(config: &Config) -> Result<Self, VoiceError> {
        let voice_service = VoiceService::from_config(&config.voice)?;
        Ok(Self::new(voice_service, config))
    }

    /// Guard for audio and control frames, keyed by user.
    pub fn voice_message_guard(&self) -> RateLimitGuard {
        RateLimitGuard::new(
            self.rate_limiter.clone(),
            self.rate_limits.voice_messages,
            IdentityMode::User,
            api_voice::VOICE_MESSAGE_SCOPE,
        )
    }

    /// Guard for `GET /api/voice/sessions`, keyed by remote address.
    pub fn sessions_api_guard(&self) -> RateLimitGuard {
        RateLimitGuard::new(
            self.rate_limiter.clone(),
            self.rate_limits.sessions_api,
            IdentityMode::Ip,
            LIST_SESSIONS_SCOPE,
        )
    }
}

/// Maximum request body size for REST routes.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Health check handler.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Builds the application router.
///
/// Handlers that need the peer address extract `ConnectInfo<SocketAddr>`,
/// so the router must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/voice/sessions", get(api_voice::list_sessions_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.sessions_api_guard(),
            middleware::rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/voice-stream", get(api_voice::voice_stream_handler))
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::identity_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
