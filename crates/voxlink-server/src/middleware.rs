//! Caller identification and sliding-window rate limiting.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Message returned with HTTP 429 responses.
pub const REST_LIMIT_MESSAGE: &str = "Too many requests. Please try again later.";

/// Message carried by rate-limit `error` events on the voice stream.
pub const SOCKET_LIMIT_MESSAGE: &str = "Too many messages. Please slow down.";

/// Number of tracked keys above which expired buckets are evicted.
const MAX_TRACKED_KEYS: usize = 10_000;

/// The caller's user id, stored in request extensions.
#[derive(Clone, Debug)]
pub struct UserContext(pub String);

/// Copies the `X-User-Id` header into a [`UserContext`] extension.
///
/// # Security Note
///
/// The header is taken at face value. Authentication is handled outside
/// this service; the value only selects the rate-limit bucket.
pub async fn identity_middleware(mut req: Request<Body>, next: Next) -> Response {
    let user = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if let Some(user) = user {
        req.extensions_mut().insert(UserContext(user));
    }

    next.run(req).await
}

/// An admission rule: at most `max_requests` in any trailing
/// `window_seconds` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimit {
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// How a guarded call site identifies its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    /// Per user, falling back to the remote address for anonymous callers.
    User,
    /// Per remote address.
    Ip,
    /// A fixed caller-supplied identity.
    Custom(String),
}

impl IdentityMode {
    /// Renders the identity half of a rate-limit key.
    pub fn resolve(&self, user_id: Option<&str>, remote: Option<IpAddr>) -> String {
        let by_ip = || match remote {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        };

        match self {
            Self::User => match user_id.filter(|u| !u.is_empty()) {
                Some(user) => format!("user:{}", user),
                None => by_ip(),
            },
            Self::Ip => by_ip(),
            Self::Custom(identity) => identity.clone(),
        }
    }
}

/// Rate limiting key: `scope:identity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(scope: &str, identity: &str) -> Self {
        Self(format!("{}:{}", scope, identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Admitted,
    Limited { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug)]
struct Bucket {
    /// Admission instants, oldest first.
    stamps: VecDeque<Instant>,
    window: Duration,
}

impl Bucket {
    fn is_expired(&self, now: Instant) -> bool {
        self.stamps
            .back()
            .map_or(true, |last| now.saturating_duration_since(*last) > self.window)
    }
}

/// In-memory sliding-window rate limiter.
///
/// The whole read-evaluate-record sequence runs under one mutex, so
/// concurrent checks of the same key never admit more than the rule allows.
/// State is process-local and is lost on restart.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<RateLimitKey, Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `key` against `rule` at the current instant.
    pub fn check(&self, key: &RateLimitKey, rule: RateLimit) -> RateLimitDecision {
        self.check_at(key, rule, Instant::now())
    }

    /// Checks `key` against `rule` as of `now`.
    ///
    /// Only admissions are recorded; a denied check leaves the bucket as it was.
    pub fn check_at(&self, key: &RateLimitKey, rule: RateLimit, now: Instant) -> RateLimitDecision {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        };

        // Evict only buckets whose window has fully passed so active limits survive.
        if buckets.len() > MAX_TRACKED_KEYS {
            buckets.retain(|_, bucket| !bucket.is_expired(now));
        }

        let window = rule.window();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            stamps: VecDeque::new(),
            window,
        });
        bucket.window = window;

        while let Some(oldest) = bucket.stamps.front() {
            if now.saturating_duration_since(*oldest) > window {
                bucket.stamps.pop_front();
            } else {
                break;
            }
        }

        if bucket.stamps.len() >= rule.max_requests as usize {
            let retry_after_seconds = match bucket.stamps.front() {
                Some(oldest) => (*oldest + window).saturating_duration_since(now).as_secs() + 1,
                None => rule.window_seconds + 1,
            };
            return RateLimitDecision::Limited {
                retry_after_seconds,
            };
        }

        bucket.stamps.push_back(now);
        RateLimitDecision::Admitted
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// A rate limit bound to one protected operation.
#[derive(Clone, Debug)]
pub struct RateLimitGuard {
    limiter: RateLimiter,
    rule: RateLimit,
    identity: IdentityMode,
    scope: Arc<str>,
}

impl RateLimitGuard {
    pub fn new(
        limiter: RateLimiter,
        rule: RateLimit,
        identity: IdentityMode,
        scope: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            limiter,
            rule,
            identity,
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn key_for(&self, user_id: Option<&str>, remote: Option<IpAddr>) -> RateLimitKey {
        RateLimitKey::new(&self.scope, &self.identity.resolve(user_id, remote))
    }

    pub fn check(&self, user_id: Option<&str>, remote: Option<IpAddr>) -> RateLimitDecision {
        self.limiter.check(&self.key_for(user_id, remote), self.rule)
    }
}

/// Rate limiting middleware for REST routes, installed with
/// `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_middleware(
    State(guard): State<RateLimitGuard>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let user = req.extensions().get::<UserContext>().map(|u| u.0.clone());
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match guard.check(user.as_deref(), remote) {
        RateLimitDecision::Admitted => next.run(req).await,
        RateLimitDecision::Limited {
            retry_after_seconds,
        } => {
            tracing::warn!(
                scope = guard.scope(),
                key = %guard.key_for(user.as_deref(), remote),
                retry_after_seconds,
                "request rate limited"
            );
            rate_limited_response(retry_after_seconds)
        }
    }
}

/// HTTP 429 with `Retry-After` and a JSON body.
pub fn rate_limited_response(retry_after_seconds: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_seconds.to_string())],
        Json(serde_json::json!({
            "error": "rate_limited",
            "message": REST_LIMIT_MESSAGE,
            "retry_after_seconds": retry_after_seconds,
        })),
    )
        .into_response()
}
