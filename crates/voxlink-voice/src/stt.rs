//! whisper.cpp speech-to-text backend.

use crate::backend::{BackendSession, SessionIdentifiers, SpeechBackend};
use crate::config::WhisperConfig;
use crate::error::VoiceError;
use crate::tts::Synthesizer;
use crate::utterance::{Transcriber, UtteranceSession};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

/// Container formats whisper.cpp reads from stdin.
const SUPPORTED_FORMATS: &[&str] = &["wav", "wave", "audio/wav", "audio/wave"];

fn is_supported_format(format: &str) -> bool {
    let format = format.trim().to_ascii_lowercase();
    SUPPORTED_FORMATS.contains(&format.as_str())
}

/// Runs the whisper.cpp CLI over one utterance at a time.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    model_path: PathBuf,
    binary_path: PathBuf,
    language: Option<String>,
    timeout: Duration,
    max_input_bytes: usize,
}

impl WhisperTranscriber {
    pub fn from_config(config: &WhisperConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            binary_path: config.binary_path.clone(),
            language: config.language.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            max_input_bytes: config.max_audio_bytes,
        }
    }

    pub async fn transcribe_bytes(&self, audio_data: &[u8]) -> Result<String, VoiceError> {
        if audio_data.len() > self.max_input_bytes {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                self.max_input_bytes
            )));
        }

        let mut command = Command::new(&self.binary_path);

        // -m <model>: GGML model, -f -: read audio from stdin, -nt: no timestamps
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .arg("-nt");
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("Failed to spawn STT binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Stt("Failed to open stdin".to_string()))?;

        stdin
            .write_all(audio_data)
            .await
            .map_err(|e| VoiceError::Stt(format!("Failed to write to stdin: {}", e)))?;
        drop(stdin); // EOF

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Stt(format!(
                    "STT process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Stt(format!("Failed to read stdout: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {}", stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, VoiceError> {
        if !is_supported_format(format) {
            return Err(VoiceError::InvalidAudio(format!(
                "whisper cannot decode '{}' audio; send wav",
                format
            )));
        }
        self.transcribe_bytes(audio).await
    }
}

/// Backend that transcribes each utterance with a local whisper.cpp install.
#[derive(Clone)]
pub struct WhisperBackend {
    transcriber: Arc<WhisperTranscriber>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    max_audio_bytes: usize,
    output_buffer: usize,
}

impl std::fmt::Debug for WhisperBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperBackend")
            .field("transcriber", &self.transcriber)
            .field("tts", &self.synthesizer.is_some())
            .finish()
    }
}

impl WhisperBackend {
    /// Validates the static parts of the configuration.
    ///
    /// File existence is checked per session in `open_session`, so a model
    /// installed after startup is picked up without a restart.
    pub fn new(config: &WhisperConfig, output_buffer: usize) -> Result<Self, VoiceError> {
        if config.binary_path.as_os_str().is_empty() {
            return Err(VoiceError::Config(
                "voice.whisper.binary_path must not be empty".to_string(),
            ));
        }
        if config.model_path.as_os_str().is_empty() {
            return Err(VoiceError::Config(
                "voice.whisper.model_path must not be empty".to_string(),
            ));
        }
        if config.max_audio_bytes == 0 {
            return Err(VoiceError::Config(
                "voice.whisper.max_audio_bytes must be positive".to_string(),
            ));
        }

        Ok(Self {
            transcriber: Arc::new(WhisperTranscriber::from_config(config)),
            synthesizer: None,
            max_audio_bytes: config.max_audio_bytes,
            output_buffer,
        })
    }

    /// Speaks each transcript back through `synthesizer`.
    pub fn with_synthesizer(mut self, synthesizer: Option<Arc<dyn Synthesizer>>) -> Self {
        self.synthesizer = synthesizer;
        self
    }
}

/// A bare program name is resolved through `PATH` at spawn time.
fn is_explicit_path(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}

#[async_trait]
impl SpeechBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn open_session(
        &self,
        ids: &SessionIdentifiers,
    ) -> Result<Box<dyn BackendSession>, VoiceError> {
        let model = &self.transcriber.model_path;
        if !tokio::fs::try_exists(model).await.unwrap_or(false) {
            return Err(VoiceError::BackendUnavailable(format!(
                "whisper model not found at {}",
                model.display()
            )));
        }

        let binary = &self.transcriber.binary_path;
        if is_explicit_path(binary) && !tokio::fs::try_exists(binary).await.unwrap_or(false) {
            return Err(VoiceError::BackendUnavailable(format!(
                "whisper binary not found at {}",
                binary.display()
            )));
        }

        info!(
            session_id = %ids.session_id,
            model = %model.display(),
            "opening whisper voice session"
        );

        Ok(Box::new(UtteranceSession::new(
            ids.session_id.clone(),
            self.transcriber.clone(),
            self.max_audio_bytes,
            self.output_buffer,
        )
        .with_synthesizer(self.synthesizer.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_binary_names_are_not_explicit_paths() {
        assert!(!is_explicit_path(Path::new("whisper-cli")));
        assert!(is_explicit_path(Path::new("./bin/whisper-cli")));
        assert!(is_explicit_path(Path::new("/usr/local/bin/whisper-cli")));
    }

    #[test]
    fn empty_model_path_is_a_config_error() {
        let config = WhisperConfig::default();
        assert!(matches!(
            WhisperBackend::new(&config, 8),
            Err(VoiceError::Config(_))
        ));
    }

    fn transcriber_at(binary: PathBuf) -> WhisperTranscriber {
        WhisperTranscriber::from_config(&WhisperConfig {
            binary_path: binary,
            model_path: "/models/ggml-base.en.bin".into(),
            ..WhisperConfig::default()
        })
    }

    #[test]
    fn only_wav_is_supported() {
        assert!(is_supported_format("wav"));
        assert!(is_supported_format(" WAV "));
        assert!(is_supported_format("audio/wav"));
        assert!(!is_supported_format("webm"));
        assert!(!is_supported_format(""));
    }

    #[tokio::test]
    async fn unsupported_format_is_invalid_audio_without_spawning() {
        let transcriber = transcriber_at("/nonexistent/whisper-cli".into());
        let result = transcriber.transcribe(b"RIFF", "webm").await;
        assert!(matches!(result, Err(VoiceError::InvalidAudio(_))));

        let result = transcriber.transcribe(b"RIFF", "wav").await;
        assert!(matches!(result, Err(VoiceError::Stt(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn whisper_stdout_becomes_the_transcript() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("whisper-cli");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho '  hello there  '\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transcriber = transcriber_at(script);
        assert_eq!(
            transcriber.transcribe(b"RIFF....", "wav").await.unwrap(),
            "hello there"
        );
    }
}
