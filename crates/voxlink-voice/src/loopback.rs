use crate::backend::{BackendSession, SessionIdentifiers, SpeechBackend};
use crate::error::VoiceError;
use crate::tts::Synthesizer;
use crate::utterance::{Transcriber, UtteranceSession};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Loopback utterances are capped well below the whisper default.
const LOOPBACK_MAX_UTTERANCE_BYTES: usize = 4 * 1024 * 1024;

/// Development backend: reports the size of every utterance it receives.
///
/// Needs no external service, so a fresh checkout can exercise the full
/// streaming path end to end.
#[derive(Clone)]
pub struct LoopbackBackend {
    output_buffer: usize,
    synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl LoopbackBackend {
    pub fn new(output_buffer: usize) -> Self {
        Self {
            output_buffer,
            synthesizer: None,
        }
    }

    /// Speaks each size report back through `synthesizer`.
    pub fn with_synthesizer(mut self, synthesizer: Option<Arc<dyn Synthesizer>>) -> Self {
        self.synthesizer = synthesizer;
        self
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("output_buffer", &self.output_buffer)
            .field("tts", &self.synthesizer.is_some())
            .finish()
    }
}

struct SizeReporter;

#[async_trait]
impl Transcriber for SizeReporter {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, VoiceError> {
        Ok(format!(
            "received {} bytes of {} audio",
            audio.len(),
            if format.is_empty() { "unknown" } else { format }
        ))
    }
}

#[async_trait]
impl SpeechBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn open_session(
        &self,
        ids: &SessionIdentifiers,
    ) -> Result<Box<dyn BackendSession>, VoiceError> {
        info!(session_id = %ids.session_id, "opening loopback voice session");
        Ok(Box::new(UtteranceSession::new(
            ids.session_id.clone(),
            Arc::new(SizeReporter),
            LOOPBACK_MAX_UTTERANCE_BYTES,
            self.output_buffer,
        )
        .with_synthesizer(self.synthesizer.clone())))
    }
}
