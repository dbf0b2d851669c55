use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// The speech backend could not be reached or refused the session.
    #[error("voice backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend failed while handling input for an established session.
    #[error("voice backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("invalid audio chunk: {0}")]
    InvalidAudio(String),

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("voice session is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// The output stream of a session has already been handed out.
    #[error("voice session output has already been taken")]
    OutputTaken,
}
