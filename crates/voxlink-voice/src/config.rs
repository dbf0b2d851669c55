use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default capacity of the per-session output event channel.
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;

fn default_output_buffer() -> usize {
    DEFAULT_OUTPUT_BUFFER
}

fn default_whisper_binary() -> PathBuf {
    PathBuf::from("whisper-cli")
}

fn default_whisper_timeout_seconds() -> u64 {
    120
}

fn default_max_audio_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_piper_binary() -> PathBuf {
    PathBuf::from("piper")
}

fn default_tts_timeout_seconds() -> u64 {
    60
}

fn default_tts_speed() -> f32 {
    1.0
}

/// Which speech backend a [`VoiceService`](crate::VoiceService) drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process development backend that reports what it received.
    #[default]
    Loopback,
    /// Local whisper.cpp transcription.
    Whisper,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Whisper => "whisper",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loopback" => Ok(Self::Loopback),
            "whisper" => Ok(Self::Whisper),
            other => Err(format!("unknown voice backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voice subsystem configuration (`[voice]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub whisper: WhisperConfig,

    /// Optional speech synthesis of each transcript.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Capacity of the bounded channel between a backend and its output stream.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            whisper: WhisperConfig::default(),
            tts: TtsConfig::default(),
            output_buffer: default_output_buffer(),
        }
    }
}

/// Settings for the whisper.cpp backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// Path to the whisper.cpp CLI binary.
    #[serde(default = "default_whisper_binary")]
    pub binary_path: PathBuf,

    /// Path to the GGML model file.
    #[serde(default)]
    pub model_path: PathBuf,

    /// Optional spoken language hint passed as `-l`.
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_whisper_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Upper bound for one buffered utterance.
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary_path: default_whisper_binary(),
            model_path: PathBuf::new(),
            language: None,
            timeout_seconds: default_whisper_timeout_seconds(),
            max_audio_bytes: default_max_audio_bytes(),
        }
    }
}

/// Piper text-to-speech settings (`[voice.tts]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// When false no synthesis stage runs and no `audio` events are produced.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_piper_binary")]
    pub binary_path: PathBuf,

    /// Piper `.onnx` voice model.
    #[serde(default)]
    pub model_path: PathBuf,

    /// Playback speed; piper's length scale is its inverse.
    #[serde(default = "default_tts_speed")]
    pub speed: f32,

    #[serde(default = "default_tts_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary_path: default_piper_binary(),
            model_path: PathBuf::new(),
            speed: default_tts_speed(),
            timeout_seconds: default_tts_timeout_seconds(),
        }
    }
}
