//! End-to-end tests for `/voice-stream` over a real socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use voxlink_server::config::Config;
use voxlink_server::middleware::RateLimit;
use voxlink_server::{app, AppState};
use voxlink_voice::{
    AudioChunk, BackendSession, OutputChannel, OutputEvent, OutputStream, SessionIdentifiers,
    SpeechBackend, VoiceError, VoiceService,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Emits `burst` numbered deltas and then `"hi"` on every final chunk.
#[derive(Default)]
struct ScriptedBackend {
    refuse_sessions: bool,
    fail_audio: bool,
    burst: usize,
}

struct ScriptedSession {
    output: OutputChannel,
    fail_audio: bool,
    burst: usize,
}

#[async_trait]
impl SpeechBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open_session(
        &self,
        _ids: &SessionIdentifiers,
    ) -> Result<Box<dyn BackendSession>, VoiceError> {
        if self.refuse_sessions {
            return Err(VoiceError::BackendUnavailable("connection refused".to_string()));
        }
        Ok(Box::new(ScriptedSession {
            output: OutputChannel::new(16),
            fail_audio: self.fail_audio,
            burst: self.burst,
        }))
    }
}

#[async_trait]
impl BackendSession for ScriptedSession {
    async fn process_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), VoiceError> {
        if self.fail_audio {
            return Err(VoiceError::Backend("decoder crashed".to_string()));
        }
        if chunk.is_final {
            for i in 0..self.burst {
                self.output
                    .emit(OutputEvent::TranscriptDelta {
                        text: i.to_string(),
                    })
                    .await?;
            }
            self.output
                .emit(OutputEvent::Transcript {
                    text: "hi".to_string(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_control(
        &mut self,
        command: &str,
        _params: &Map<String, Value>,
    ) -> Result<(), VoiceError> {
        if command == "end" {
            self.output.emit(OutputEvent::Complete).await?;
            self.output.close();
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take_stream()
    }

    async fn stop(&mut self) -> Result<(), VoiceError> {
        self.output.close();
        Ok(())
    }
}

async fn spawn_server(backend: ScriptedBackend, config: Config) -> (SocketAddr, AppState) {
    let state = AppState::new(VoiceService::with_backend(Arc::new(backend)), &config);
    let router = app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let url = format!("ws://{}/voice-stream{}", addr, query);
    let (ws, _) = connect_async(url).await.expect("failed to connect");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

async fn expect_close(ws: &mut Ws) -> u16 {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without a close frame")
            .expect("websocket error");
        match msg {
            Message::Close(Some(frame)) => return frame.code.into(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a close frame, got {:?}", other),
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn query_param_session_round_trip() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;

    assert_eq!(
        next_json(&mut ws).await,
        json!({"type":"started","session_id":"s1","user_id":"u1","chat_id":"c1"})
    );
    wait_until(|| state.sessions.contains("s1")).await;

    send_json(
        &mut ws,
        json!({"type":"audio_chunk","data":"AAAA","format":"webm","is_final":true}),
    )
    .await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type":"transcript","text":"hi"})
    );

    ws.close(None).await.unwrap();
    wait_until(|| !state.sessions.contains("s1")).await;
}

#[tokio::test]
async fn start_message_assigns_placeholders() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, json!({"type":"start"})).await;
    let started = next_json(&mut ws).await;

    assert_eq!(started["type"], "started");
    assert_eq!(started["user_id"], "test_user");
    assert_eq!(started["chat_id"], "test_chat");
    let session_id = started["session_id"].as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&session_id).is_ok());

    wait_until(|| state.sessions.contains(&session_id)).await;
    let entry = state.sessions.get(&session_id).unwrap();
    assert_eq!(entry.user_id, "test_user");
}

#[tokio::test]
async fn wrong_first_message_is_rejected_with_validation_close() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1").await;

    send_json(&mut ws, json!({"type":"audio_chunk","data":"AAAA"})).await;

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(
        error["message"],
        "First WebSocket message must be of type 'start'."
    );
    assert_eq!(expect_close(&mut ws).await, 4000);
    assert!(state.sessions.is_empty());
}

#[tokio::test]
async fn invalid_json_start_is_rejected() {
    let (addr, _state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "").await;

    ws.send(Message::Text("{oops".into())).await.unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["message"], "Invalid JSON in start message.");
    assert_eq!(expect_close(&mut ws).await, 4000);
}

#[tokio::test]
async fn silent_client_times_out_during_handshake() {
    let mut config = Config::default();
    config.stream.handshake_timeout_seconds = 1;
    let (addr, _state) = spawn_server(ScriptedBackend::default(), config).await;
    let mut ws = connect(addr, "").await;

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(expect_close(&mut ws).await, 4000);
}

#[tokio::test]
async fn backend_init_failure_closes_with_internal_error() {
    let backend = ScriptedBackend {
        refuse_sessions: true,
        ..Default::default()
    };
    let (addr, state) = spawn_server(backend, Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;

    assert_eq!(next_json(&mut ws).await["type"], "started");
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(expect_close(&mut ws).await, 1011);
    assert!(!state.sessions.contains("s1"));
}

#[tokio::test]
async fn backend_fault_mid_stream_ends_session() {
    let backend = ScriptedBackend {
        fail_audio: true,
        ..Default::default()
    };
    let (addr, state) = spawn_server(backend, Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type":"audio_chunk","data":"AAAA"})).await;

    let error = next_json(&mut ws).await;
    assert_eq!(error["message"], "Internal server error in voice stream.");
    assert_eq!(expect_close(&mut ws).await, 1011);
    wait_until(|| state.sessions.is_empty()).await;
}

#[tokio::test]
async fn abrupt_disconnect_clears_registry() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    assert_eq!(next_json(&mut ws).await["type"], "started");
    wait_until(|| state.sessions.contains("s1")).await;

    // Drop the TCP stream without a close handshake.
    drop(ws.into_inner());
    wait_until(|| !state.sessions.contains("s1")).await;

    let mut again = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    assert_eq!(next_json(&mut again).await["type"], "started");
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_disconnect() {
    let (addr, _state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut ws).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    send_json(&mut ws, json!({"type":"dance"})).await;
    send_json(&mut ws, json!({"type":"audio_chunk"})).await;
    send_json(&mut ws, json!({"type":"control"})).await;
    send_json(&mut ws, json!({"type":"start","user_id":"other"})).await;
    send_json(&mut ws, json!({"type":"audio_chunk","data":"AAAA","is_final":true})).await;

    assert_eq!(
        next_json(&mut ws).await,
        json!({"type":"transcript","text":"hi"})
    );
}

#[tokio::test]
async fn outbound_events_keep_backend_order() {
    let backend = ScriptedBackend {
        burst: 100,
        ..Default::default()
    };
    let (addr, _state) = spawn_server(backend, Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type":"audio_chunk","data":"AAAA","is_final":true})).await;

    for i in 0..100 {
        let event = next_json(&mut ws).await;
        assert_eq!(event, json!({"type":"transcript_delta","text":i.to_string()}));
    }
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type":"transcript","text":"hi"})
    );
}

#[tokio::test]
async fn backend_completion_closes_normally() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type":"control","command":"end"})).await;

    assert_eq!(next_json(&mut ws).await, json!({"type":"complete"}));
    assert_eq!(expect_close(&mut ws).await, 1000);
    wait_until(|| state.sessions.is_empty()).await;
}

#[tokio::test]
async fn rate_limited_frames_get_an_error_event_without_disconnect() {
    let mut config = Config::default();
    config.rate_limit.voice_messages = RateLimit::new(2, 60);
    let (addr, state) = spawn_server(ScriptedBackend::default(), config).await;
    let mut ws = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut ws).await;

    for _ in 0..3 {
        send_json(&mut ws, json!({"type":"audio_chunk","data":"AAAA"})).await;
    }

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Too many messages. Please slow down.");
    assert!(error["retry_after_seconds"].as_u64().unwrap() >= 1);
    assert!(state.sessions.contains("s1"));
}

#[tokio::test]
async fn duplicate_session_id_is_refused() {
    let (addr, state) = spawn_server(ScriptedBackend::default(), Config::default()).await;

    let mut first = connect(addr, "?user_id=u1&chat_id=c1&session_id=s1").await;
    next_json(&mut first).await;
    wait_until(|| state.sessions.contains("s1")).await;

    let mut second = connect(addr, "?user_id=u2&chat_id=c2&session_id=s1").await;
    assert_eq!(next_json(&mut second).await["type"], "started");
    let error = next_json(&mut second).await;
    assert_eq!(error["message"], "session s1 is already active");
    assert_eq!(expect_close(&mut second).await, 4000);

    assert_eq!(state.sessions.get("s1").unwrap().user_id, "u1");
    send_json(&mut first, json!({"type":"audio_chunk","data":"AAAA","is_final":true})).await;
    assert_eq!(next_json(&mut first).await["type"], "transcript");
}
