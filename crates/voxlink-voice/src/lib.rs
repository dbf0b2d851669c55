//! Speech backend capability for the Voxlink voice streaming server.
//!
//! A [`VoiceService`] is built once from configuration and opens one
//! backend session per conversation. The server drives each conversation
//! through a [`VoiceSession`], which forwards audio and control input to the
//! backend and hands out the backend's ordered [`OutputEvent`] stream.
//!
//! Two backends ship with the crate: a loopback backend for development and
//! a whisper.cpp transcription backend. Either can speak its transcripts
//! back through an optional piper [`Synthesizer`]. Other backends plug in through the
//! [`SpeechBackend`] and [`BackendSession`] traits.

pub mod backend;
pub mod config;
pub mod error;
pub mod loopback;
pub mod service;
pub mod session;
pub mod stt;
pub mod tts;
pub mod utterance;

pub use backend::{
    AudioChunk, BackendSession, OutputChannel, OutputEvent, OutputStream, SessionIdentifiers,
    SpeechBackend,
};
pub use config::{BackendKind, TtsConfig, VoiceConfig, WhisperConfig};
pub use error::VoiceError;
pub use loopback::LoopbackBackend;
pub use service::VoiceService;
pub use session::{SessionState, VoiceSession};
pub use stt::{WhisperBackend, WhisperTranscriber};
pub use tts::{PiperSynthesizer, Synthesizer, PIPER_AUDIO_FORMAT};
pub use utterance::{Transcriber, UtteranceSession};
