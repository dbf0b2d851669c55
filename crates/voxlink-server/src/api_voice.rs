//! Real-time voice streaming over WebSocket: `GET /voice-stream`.
//!
//! Each connection runs in one task. After the handshake two pumps run
//! concurrently: the inbound pump forwards client frames to the voice
//! session, and the outbound pump forwards backend output (and server
//! notices) to the client. Whichever finishes first cancels the other.

use crate::handshake::{self, HandshakeError, VoiceStreamParams};
use crate::middleware::{RateLimitDecision, RateLimitGuard, SOCKET_LIMIT_MESSAGE};
use crate::registry::{ActiveSession, RegistryError};
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::mpsc;
use voxlink_voice::{AudioChunk, OutputStream, SessionIdentifiers, VoiceError, VoiceSession};

/// Close code for handshake and validation failures.
pub const CLOSE_VALIDATION: u16 = 4000;

/// Rate limit scope for audio and control frames.
pub const VOICE_MESSAGE_SCOPE: &str = "voice_message";

const DEFAULT_AUDIO_FORMAT: &str = "webm";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error in voice stream.";
const BACKEND_UNAVAILABLE_MESSAGE: &str = "Voice backend unavailable.";

// RFC 6455 limits the close reason to 123 bytes.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Frames a client may send once the session is active.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A repeated start message; ignored.
    Start,
    AudioChunk {
        data: String,
        #[serde(default)]
        format: Option<String>,
        /// Any JSON value; read by truthiness, so `1` and `"yes"` count.
        #[serde(default)]
        is_final: Option<Value>,
    },
    Control {
        command: String,
        #[serde(default)]
        params: Option<Map<String, Value>>,
    },
}

/// Server events other than backend output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Started {
        session_id: String,
        user_id: String,
        chat_id: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<u64>,
    },
}

impl OutgoingMessage {
    pub fn started(ids: &SessionIdentifiers) -> Self {
        Self::Started {
            session_id: ids.session_id.clone(),
            user_id: ids.user_id.clone(),
            chat_id: ids.chat_id.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::Error {
            message: SOCKET_LIMIT_MESSAGE.to_string(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

/// Lifecycle of one `/voice-stream` connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Handshaking,
    Initializing,
    Active,
    Closing,
    Closed,
    Failed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Handshaking, Initializing)
                | (Initializing, Active)
                | (Handshaking | Initializing, Failed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Phase tracking with transition logging.
#[derive(Debug)]
struct Lifecycle {
    phase: ConnectionPhase,
    session_id: Option<String>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Handshaking,
            session_id: None,
        }
    }

    fn advance(&mut self, next: ConnectionPhase) {
        let session_id = self.session_id.as_deref().unwrap_or("-");
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                session_id,
                from = self.phase.as_str(),
                to = next.as_str(),
                "unexpected voice connection phase transition"
            );
        }
        tracing::debug!(
            session_id,
            from = self.phase.as_str(),
            to = next.as_str(),
            "voice connection phase"
        );
        self.phase = next;
    }
}

/// Failures before the session becomes active.
#[derive(Debug, Error)]
pub enum StreamFailure {
    #[error(transparent)]
    Protocol(#[from] HandshakeError),

    #[error(transparent)]
    Duplicate(#[from] RegistryError),

    #[error("voice backend unavailable: {0}")]
    Backend(#[source] VoiceError),
}

impl StreamFailure {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) | Self::Duplicate(_) => CLOSE_VALIDATION,
            Self::Backend(_) => close_code::ERROR,
        }
    }

    /// Text of the `error` event sent to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Protocol(e) => e.to_string(),
            Self::Duplicate(e) => e.to_string(),
            Self::Backend(_) => BACKEND_UNAVAILABLE_MESSAGE.to_string(),
        }
    }
}

/// Why the active phase ended.
#[derive(Debug)]
enum PumpExit {
    /// Close frame received or the inbound stream ended.
    ClientClosed,
    /// Receiving from or sending to the transport failed.
    TransportFault(axum::Error),
    /// The backend closed its output.
    OutputEnded,
    /// The backend failed while handling input.
    BackendFault(VoiceError),
}

/// `GET /voice-stream?user_id=..&chat_id=..&session_id=..`
///
/// The query parameters are optional; when any is missing the client must
/// send a start message first.
pub async fn voice_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<VoiceStreamParams>,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "voice stream upgrade requested");
    ws.on_upgrade(move |socket| handle_voice_socket(socket, state, params, addr))
}

/// `GET /api/voice/sessions`
pub async fn list_sessions_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<ActiveSession> = state.sessions.snapshot();
    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn handle_voice_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    params: VoiceStreamParams,
    remote: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut lifecycle = Lifecycle::new();

    let (ids, path) =
        match handshake::resolve(&params, &mut receiver, state.handshake_timeout).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(remote_addr = %remote, "voice stream handshake failed: {}", e);
                fail(&mut sender, &mut lifecycle, e.into()).await;
                return;
            }
        };
    lifecycle.session_id = Some(ids.session_id.clone());

    tracing::info!(
        session_id = %ids.session_id,
        user_id = %ids.user_id,
        chat_id = %ids.chat_id,
        remote_addr = %remote,
        handshake = path.as_str(),
        "voice stream handshake resolved"
    );

    if let Err(e) = send_json(&mut sender, &OutgoingMessage::started(&ids)).await {
        tracing::warn!(session_id = %ids.session_id, "failed to acknowledge voice stream: {}", e);
        lifecycle.advance(ConnectionPhase::Failed);
        return;
    }
    lifecycle.advance(ConnectionPhase::Initializing);

    let mut session = VoiceSession::new(ids.clone(), state.voice_service.clone());
    if let Err(e) = session.initialize().await {
        tracing::error!(
            session_id = %ids.session_id,
            backend = state.voice_service.backend_name(),
            "voice backend initialization failed: {}",
            e
        );
        session.stop().await;
        fail(&mut sender, &mut lifecycle, StreamFailure::Backend(e)).await;
        return;
    }

    let lease = match state
        .sessions
        .register(&ids.session_id, &ids.user_id, &ids.chat_id)
    {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(session_id = %ids.session_id, "rejecting voice stream: {}", e);
            session.stop().await;
            fail(&mut sender, &mut lifecycle, e.into()).await;
            return;
        }
    };
    lifecycle.advance(ConnectionPhase::Active);
    tracing::info!(session_id = %ids.session_id, "voice stream active");

    let limits = InboundLimits {
        guard: state.voice_message_guard(),
        user_id: ids.user_id.clone(),
        remote: remote.ip(),
    };
    let exit = run_active(
        &mut session,
        &mut sender,
        &mut receiver,
        &limits,
        state.notice_buffer,
    )
    .await;

    lifecycle.advance(ConnectionPhase::Closing);
    match &exit {
        PumpExit::ClientClosed => {
            tracing::info!(session_id = %ids.session_id, "client closed voice stream")
        }
        PumpExit::OutputEnded => {
            tracing::info!(session_id = %ids.session_id, "voice backend finished")
        }
        PumpExit::TransportFault(e) => {
            tracing::warn!(session_id = %ids.session_id, "voice stream transport fault: {}", e)
        }
        PumpExit::BackendFault(e) => {
            tracing::error!(session_id = %ids.session_id, "voice backend failed mid-stream: {}", e)
        }
    }

    session.stop().await;
    drop(lease);

    match exit {
        PumpExit::BackendFault(_) => {
            if let Err(e) = send_json(&mut sender, &OutgoingMessage::error(INTERNAL_ERROR_MESSAGE)).await {
                tracing::debug!(session_id = %ids.session_id, "error event not delivered: {}", e);
            }
            close_with(&mut sender, close_code::ERROR, INTERNAL_ERROR_MESSAGE).await;
        }
        _ => close_with(&mut sender, close_code::NORMAL, "").await,
    }
    lifecycle.advance(ConnectionPhase::Closed);
    tracing::info!(session_id = %ids.session_id, "voice stream closed");
}

/// Runs both pumps until one finishes; the other is dropped.
async fn run_active<W, R>(
    session: &mut VoiceSession,
    sender: &mut W,
    receiver: &mut R,
    limits: &InboundLimits,
    notice_buffer: usize,
) -> PumpExit
where
    W: Sink<Message, Error = axum::Error> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if let Err(e) = session.start().await {
        return PumpExit::BackendFault(e);
    }
    let output = match session.output_messages() {
        Ok(output) => output,
        Err(e) => return PumpExit::BackendFault(e),
    };

    let (notice_tx, mut notice_rx) = mpsc::channel(notice_buffer.max(1));

    tokio::select! {
        exit = inbound_pump(receiver, session, limits, &notice_tx) => exit,
        exit = outbound_pump(sender, output, &mut notice_rx) => exit,
    }
}

struct InboundLimits {
    guard: RateLimitGuard,
    user_id: String,
    remote: IpAddr,
}

impl InboundLimits {
    /// Admits one data-bearing frame, queueing a notice when it is denied.
    fn admit(&self, session_id: &str, notices: &mpsc::Sender<OutgoingMessage>) -> bool {
        match self.guard.check(Some(self.user_id.as_str()), Some(self.remote)) {
            RateLimitDecision::Admitted => true,
            RateLimitDecision::Limited {
                retry_after_seconds,
            } => {
                tracing::warn!(
                    session_id,
                    key = %self.guard.key_for(Some(self.user_id.as_str()), Some(self.remote)),
                    retry_after_seconds,
                    "voice stream frame rate limited"
                );
                if let Err(e) = notices.try_send(OutgoingMessage::rate_limited(retry_after_seconds)) {
                    tracing::warn!(session_id, "rate limit notice dropped: {}", e);
                }
                false
            }
        }
    }
}

async fn inbound_pump<R>(
    receiver: &mut R,
    session: &mut VoiceSession,
    limits: &InboundLimits,
    notices: &mpsc::Sender<OutgoingMessage>,
) -> PumpExit
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let session_id = session.session_id().to_string();

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return PumpExit::ClientClosed,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Binary(data)) => {
                tracing::warn!(
                    session_id = %session_id,
                    bytes = data.len(),
                    "dropping binary frame on voice stream"
                );
                continue;
            }
            Err(e) => return PumpExit::TransportFault(e),
        };

        let incoming = match serde_json::from_str::<InboundMessage>(text.as_str()) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(session_id = %session_id, "dropping malformed voice stream frame: {}", e);
                continue;
            }
        };

        let result = match incoming {
            InboundMessage::Start => {
                tracing::info!(session_id = %session_id, "ignoring repeated start message");
                continue;
            }
            InboundMessage::AudioChunk {
                data,
                format,
                is_final,
            } => {
                if !limits.admit(&session_id, notices) {
                    continue;
                }
                let chunk = AudioChunk::new(
                    data,
                    format.unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string()),
                    is_final.as_ref().map_or(false, is_truthy),
                );
                session.process_audio_chunk(chunk).await
            }
            InboundMessage::Control { command, params } => {
                if !limits.admit(&session_id, notices) {
                    continue;
                }
                session
                    .handle_control(&command, params.unwrap_or_default())
                    .await
            }
        };

        if let Err(e) = result {
            return PumpExit::BackendFault(e);
        }
    }

    PumpExit::ClientClosed
}

async fn outbound_pump<W>(
    sender: &mut W,
    mut output: OutputStream,
    notices: &mut mpsc::Receiver<OutgoingMessage>,
) -> PumpExit
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let sent = tokio::select! {
            biased;
            Some(notice) = notices.recv() => send_json(sender, &notice).await,
            event = output.next() => match event {
                Some(event) => send_json(sender, &event).await,
                None => return PumpExit::OutputEnded,
            },
        };
        if let Err(e) = sent {
            return PumpExit::TransportFault(e);
        }
    }
}

/// Sends an error event and closes with the failure's code.
async fn fail<W>(sender: &mut W, lifecycle: &mut Lifecycle, failure: StreamFailure)
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    lifecycle.advance(ConnectionPhase::Failed);
    let message = failure.client_message();
    if let Err(e) = send_json(sender, &OutgoingMessage::error(message.clone())).await {
        tracing::debug!("error event not delivered: {}", e);
    }
    close_with(sender, failure.close_code(), &message).await;
}

async fn send_json<W, T>(sender: &mut W, payload: &T) -> Result<(), axum::Error>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(payload).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

async fn close_with<W>(sender: &mut W, code: u16, reason: &str)
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        tracing::debug!(code, "close frame not delivered: {}", e);
    }
}

/// Null, `false`, zero and empty strings or containers are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
