//! Piper text-to-speech synthesis stage.

use crate::config::TtsConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size for one synthesis (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Format tag of piper's `--output_raw` stream.
pub const PIPER_AUDIO_FORMAT: &str = "pcm_s16le";

/// Turns transcript text into audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Format tag attached to the emitted `audio` events.
    fn format(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoiceError>;
}

/// Runs the piper CLI once per synthesis.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    binary_path: PathBuf,
    model_path: PathBuf,
    length_scale: f32,
    timeout: Duration,
}

impl PiperSynthesizer {
    pub fn new(config: &TtsConfig) -> Result<Self, VoiceError> {
        if config.binary_path.as_os_str().is_empty() {
            return Err(VoiceError::Config(
                "voice.tts.binary_path must not be empty".to_string(),
            ));
        }
        if config.model_path.as_os_str().is_empty() {
            return Err(VoiceError::Config(
                "voice.tts.model_path must not be empty".to_string(),
            ));
        }
        if !(0.1..=10.0).contains(&config.speed) {
            return Err(VoiceError::Config(
                "voice.tts.speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        Ok(Self {
            binary_path: config.binary_path.clone(),
            model_path: config.model_path.clone(),
            length_scale: 1.0 / config.speed,
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    fn format(&self) -> &str {
        PIPER_AUDIO_FORMAT
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let mut child = Command::new(&self.binary_path)
            .arg("--model")
            .arg(&self.model_path)
            .arg("--output_raw")
            .arg("--length_scale")
            .arg(self.length_scale.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;

        // Written from a separate task so a full stdout pipe cannot deadlock us.
        let text_owned = text.to_string();
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "piper timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr.trim())));
        }

        Ok(output.stdout)
    }
}
