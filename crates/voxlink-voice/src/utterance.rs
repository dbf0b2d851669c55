//! Utterance-buffering backend session shared by the bundled backends.
//!
//! Audio chunks are decoded and appended to a buffer until a chunk marked
//! `is_final` arrives, at which point the buffered utterance is handed to a
//! [`Transcriber`] and the result is emitted as a `transcript` event. With a
//! [`Synthesizer`] attached, the transcript is also spoken back as an
//! `audio` event.
//!
//! A failed transcription or synthesis loses that one utterance only; the
//! session keeps accepting audio.

use crate::backend::{AudioChunk, BackendSession, OutputChannel, OutputEvent, OutputStream};
use crate::error::VoiceError;
use crate::tts::Synthesizer;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns one buffered utterance into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, VoiceError>;
}

/// Discard the buffered utterance.
pub const CONTROL_INTERRUPT: &str = "interrupt";
/// Finish the conversation: emit `complete` and end the output stream.
pub const CONTROL_END: &str = "end";

pub struct UtteranceSession {
    session_id: String,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    buffer: Vec<u8>,
    format: Option<String>,
    max_bytes: usize,
    output: OutputChannel,
}

impl UtteranceSession {
    pub fn new(
        session_id: impl Into<String>,
        transcriber: Arc<dyn Transcriber>,
        max_bytes: usize,
        output_buffer: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            transcriber,
            synthesizer: None,
            buffer: Vec::new(),
            format: None,
            max_bytes,
            output: OutputChannel::new(output_buffer),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Option<Arc<dyn Synthesizer>>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.format = None;
    }

    async fn speak(&self, text: &str) -> Result<(), VoiceError> {
        let Some(synthesizer) = &self.synthesizer else {
            return Ok(());
        };

        match synthesizer.synthesize(text).await {
            Ok(audio) if audio.is_empty() => Ok(()),
            Ok(audio) => {
                self.output
                    .emit(OutputEvent::Audio {
                        data: base64::engine::general_purpose::STANDARD.encode(audio),
                        format: synthesizer.format().to_string(),
                    })
                    .await
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "speech synthesis failed; transcript delivered without audio"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BackendSession for UtteranceSession {
    async fn process_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), VoiceError> {
        let bytes = chunk.decode()?;

        if self.buffer.len() + bytes.len() > self.max_bytes {
            self.reset();
            return Err(VoiceError::InvalidAudio(format!(
                "utterance exceeds maximum size of {} bytes",
                self.max_bytes
            )));
        }

        self.buffer.extend_from_slice(&bytes);
        self.format.get_or_insert(chunk.format);

        if !chunk.is_final {
            return Ok(());
        }

        if self.buffer.is_empty() {
            debug!(session_id = %self.session_id, "final chunk closed an empty utterance");
            return Ok(());
        }

        let format = self.format.take().unwrap_or_default();
        let audio = std::mem::take(&mut self.buffer);
        let text = match self.transcriber.transcribe(&audio, &format).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    bytes = audio.len(),
                    %format,
                    error = %e,
                    "transcription failed; dropping utterance"
                );
                return Ok(());
            }
        };

        if text.is_empty() {
            return Ok(());
        }
        self.output
            .emit(OutputEvent::Transcript { text: text.clone() })
            .await?;
        self.speak(&text).await
    }

    async fn handle_control(
        &mut self,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<(), VoiceError> {
        debug!(
            session_id = %self.session_id,
            command,
            params = params.len(),
            "applying control command"
        );

        match command {
            CONTROL_INTERRUPT => self.reset(),
            CONTROL_END => {
                self.reset();
                self.output
                    .emit(OutputEvent::ControlAck {
                        command: command.to_string(),
                    })
                    .await?;
                self.output.emit(OutputEvent::Complete).await?;
                self.output.close();
                info!(session_id = %self.session_id, "conversation ended by client");
                return Ok(());
            }
            _ => {}
        }

        self.output
            .emit(OutputEvent::ControlAck {
                command: command.to_string(),
            })
            .await
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take_stream()
    }

    async fn stop(&mut self) -> Result<(), VoiceError> {
        self.reset();
        self.output.close();
        Ok(())
    }
}
