use crate::backend::{BackendSession, SessionIdentifiers, SpeechBackend};
use crate::config::{BackendKind, VoiceConfig};
use crate::error::VoiceError;
use crate::loopback::LoopbackBackend;
use crate::stt::WhisperBackend;
use crate::tts::{PiperSynthesizer, Synthesizer};
use std::fmt;
use std::sync::Arc;

/// Entry point to the speech backend, shared by every voice connection.
#[derive(Clone)]
pub struct VoiceService {
    backend: Arc<dyn SpeechBackend>,
}

impl VoiceService {
    /// Builds the backend selected by `config.backend`, with piper attached
    /// when `config.tts.enabled`.
    pub fn from_config(config: &VoiceConfig) -> Result<Self, VoiceError> {
        if config.output_buffer == 0 {
            return Err(VoiceError::Config(
                "voice.output_buffer must be positive".to_string(),
            ));
        }

        let synthesizer: Option<Arc<dyn Synthesizer>> = if config.tts.enabled {
            Some(Arc::new(PiperSynthesizer::new(&config.tts)?))
        } else {
            None
        };

        let backend: Arc<dyn SpeechBackend> = match config.backend {
            BackendKind::Loopback => Arc::new(
                LoopbackBackend::new(config.output_buffer).with_synthesizer(synthesizer),
            ),
            BackendKind::Whisper => Arc::new(
                WhisperBackend::new(&config.whisper, config.output_buffer)?
                    .with_synthesizer(synthesizer),
            ),
        };
        Ok(Self { backend })
    }

    /// Wraps an arbitrary backend implementation.
    pub fn with_backend(backend: Arc<dyn SpeechBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) async fn open_session(
        &self,
        ids: &SessionIdentifiers,
    ) -> Result<Box<dyn BackendSession>, VoiceError> {
        self.backend.open_session(ids).await
    }
}

impl fmt::Debug for VoiceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceService")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_loopback_service() {
        let service = VoiceService::from_config(&VoiceConfig::default()).unwrap();
        assert_eq!(service.backend_name(), "loopback");
    }

    #[test]
    fn zero_output_buffer_is_rejected() {
        let config = VoiceConfig {
            output_buffer: 0,
            ..VoiceConfig::default()
        };
        assert!(matches!(
            VoiceService::from_config(&config),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn whisper_without_model_is_rejected() {
        let config = VoiceConfig {
            backend: BackendKind::Whisper,
            ..VoiceConfig::default()
        };
        assert!(matches!(
            VoiceService::from_config(&config),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn enabled_tts_without_voice_model_is_rejected() {
        let mut config = VoiceConfig::default();
        config.tts.enabled = true;
        assert!(matches!(
            VoiceService::from_config(&config),
            Err(VoiceError::Config(_))
        ));

        config.tts.model_path = "/voices/amy.onnx".into();
        assert_eq!(
            VoiceService::from_config(&config).unwrap().backend_name(),
            "loopback"
        );
    }
}
