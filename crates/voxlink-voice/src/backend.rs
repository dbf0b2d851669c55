//! Backend capability traits and the wire-neutral types that cross them.

use crate::error::VoiceError;
use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// The identifiers negotiated for one voice conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentifiers {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
}

/// One chunk of encoded audio as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Base64-encoded audio bytes.
    pub data: String,
    /// Container/codec hint, e.g. `webm` or `wav`.
    pub format: String,
    /// Marks the last chunk of an utterance.
    pub is_final: bool,
}

impl AudioChunk {
    pub fn new(data: impl Into<String>, format: impl Into<String>, is_final: bool) -> Self {
        Self {
            data: data.into(),
            format: format.into(),
            is_final,
        }
    }

    /// Decodes the base64 payload.
    pub fn decode(&self) -> Result<Vec<u8>, VoiceError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data.trim().as_bytes())
            .map_err(|e| VoiceError::InvalidAudio(format!("invalid base64 payload: {}", e)))
    }
}

/// An event produced by a backend session for delivery to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Partial transcript that may still change. The bundled backends
    /// transcribe whole utterances and never emit it; streaming backends do.
    TranscriptDelta { text: String },
    /// Final transcript of one utterance.
    Transcript { text: String },
    /// Synthesized audio frame, base64-encoded. Emitted when a synthesizer
    /// is attached.
    Audio { data: String, format: String },
    /// A control command was applied.
    ControlAck { command: String },
    /// The backend finished the conversation; no further events follow.
    Complete,
}

/// Lazy, single-consumer sequence of backend output.
pub type OutputStream = BoxStream<'static, OutputEvent>;

/// Factory for backend sessions. One instance is shared by all connections.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Establishes the backend side of a new conversation.
    async fn open_session(
        &self,
        ids: &SessionIdentifiers,
    ) -> Result<Box<dyn BackendSession>, VoiceError>;
}

/// The backend half of one conversation.
///
/// Calls arrive strictly sequentially from a single inbound pump, so
/// implementations need no internal locking.
#[async_trait]
pub trait BackendSession: Send {
    async fn start(&mut self) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn process_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), VoiceError>;

    async fn handle_control(
        &mut self,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<(), VoiceError>;

    /// Hands out the output stream. Returns `None` once it has been taken.
    fn take_output(&mut self) -> Option<OutputStream>;

    /// Releases backend resources. Must tolerate repeated calls.
    async fn stop(&mut self) -> Result<(), VoiceError>;
}

/// Bounded event channel shared by the bundled backends.
///
/// Closing the sending half ends the output stream once buffered events
/// have been drained.
#[derive(Debug)]
pub struct OutputChannel {
    tx: Option<mpsc::Sender<OutputEvent>>,
    rx: Option<mpsc::Receiver<OutputEvent>>,
}

impl OutputChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    pub fn take_stream(&mut self) -> Option<OutputStream> {
        self.rx.take().map(|rx| ReceiverStream::new(rx).boxed())
    }

    /// Queues an event, waiting for capacity if the consumer is behind.
    pub async fn emit(&self, event: OutputEvent) -> Result<(), VoiceError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| VoiceError::Backend("output stream already ended".to_string()))?;
        tx.send(event)
            .await
            .map_err(|_| VoiceError::Backend("output stream consumer is gone".to_string()))
    }

    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
