//! Session identifier negotiation for `/voice-stream`.
//!
//! Identifiers come from exactly one of two places: the `user_id`,
//! `chat_id` and `session_id` query parameters when all three are present,
//! or otherwise a `{"type":"start", ...}` message that must be the first
//! frame the client sends.

use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use voxlink_voice::SessionIdentifiers;

/// User id assigned when a start message omits one.
pub const PLACEHOLDER_USER_ID: &str = "test_user";
/// Chat id assigned when a start message omits one.
pub const PLACEHOLDER_CHAT_ID: &str = "test_chat";

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct VoiceStreamParams {
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
}

impl VoiceStreamParams {
    /// Returns the identifiers when all three parameters are non-empty.
    pub fn identifiers(&self) -> Option<SessionIdentifiers> {
        let present = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        Some(SessionIdentifiers {
            session_id: present(&self.session_id)?,
            user_id: present(&self.user_id)?,
            chat_id: present(&self.chat_id)?,
        })
    }
}

/// Where the identifiers of a connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePath {
    QueryParams,
    StartMessage,
}

impl HandshakePath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryParams => "query",
            Self::StartMessage => "start_message",
        }
    }
}

/// Protocol violations during the handshake. The display text is sent to
/// the client in the `error` event.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Expected JSON start message as the first WebSocket message.")]
    NotText,

    #[error("Invalid JSON in start message.")]
    InvalidJson,

    #[error("First WebSocket message must be of type 'start'.")]
    WrongType,

    #[error("Connection closed before a start message was received.")]
    Closed,

    #[error("Timed out waiting for a start message.")]
    TimedOut,

    #[error("Transport error before start message: {0}")]
    Transport(String),
}

/// Resolves the identifiers for a new connection.
///
/// Reads from `receiver` only when the query parameters are incomplete, and
/// then reads exactly one data frame, bounded by `timeout`.
pub async fn resolve<S>(
    params: &VoiceStreamParams,
    receiver: &mut S,
    timeout: Duration,
) -> Result<(SessionIdentifiers, HandshakePath), HandshakeError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if let Some(ids) = params.identifiers() {
        return Ok((ids, HandshakePath::QueryParams));
    }

    tracing::info!("missing query params; waiting for start message");
    let ids = tokio::time::timeout(timeout, await_start_message(receiver))
        .await
        .map_err(|_| HandshakeError::TimedOut)??;
    Ok((ids, HandshakePath::StartMessage))
}

async fn await_start_message<S>(receiver: &mut S) -> Result<SessionIdentifiers, HandshakeError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let msg = match receiver.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(HandshakeError::Transport(e.to_string())),
            None => return Err(HandshakeError::Closed),
        };

        match msg {
            Message::Text(text) => return parse_start_message(text.as_str()),
            // Keepalives are not data frames.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(HandshakeError::Closed),
            Message::Binary(_) => return Err(HandshakeError::NotText),
        }
    }
}

/// Parses a start message, filling in placeholders and a fresh session id.
pub fn parse_start_message(text: &str) -> Result<SessionIdentifiers, HandshakeError> {
    let data: Value = serde_json::from_str(text).map_err(|_| HandshakeError::InvalidJson)?;

    if data.get("type").and_then(Value::as_str) != Some("start") {
        return Err(HandshakeError::WrongType);
    }

    let field = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(SessionIdentifiers {
        user_id: field("user_id").unwrap_or_else(|| PLACEHOLDER_USER_ID.to_string()),
        chat_id: field("chat_id").unwrap_or_else(|| PLACEHOLDER_CHAT_ID.to_string()),
        session_id: field("session_id").unwrap_or_else(|| Uuid::new_v4().to_string()),
    })
}
