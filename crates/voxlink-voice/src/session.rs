use crate::backend::{AudioChunk, BackendSession, OutputStream, SessionIdentifiers};
use crate::error::VoiceError;
use crate::service::VoiceService;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Lifecycle of a [`VoiceSession`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed; no backend connection yet.
    Created,
    /// Backend connection established.
    Initialized,
    /// `start()` succeeded; audio and control input is accepted.
    Active,
    /// `stop()` has begun; the backend is released.
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }
}

/// One streaming conversation with the speech backend.
///
/// The backend connection is owned exclusively by the session: it is
/// created by [`initialize`](Self::initialize) and released by
/// [`stop`](Self::stop), and never touched outside that window.
pub struct VoiceSession {
    ids: SessionIdentifiers,
    service: VoiceService,
    backend: Option<Box<dyn BackendSession>>,
    state: SessionState,
}

impl VoiceSession {
    pub fn new(ids: SessionIdentifiers, service: VoiceService) -> Self {
        Self {
            ids,
            service,
            backend: None,
            state: SessionState::Created,
        }
    }

    pub fn ids(&self) -> &SessionIdentifiers {
        &self.ids
    }

    pub fn session_id(&self) -> &str {
        &self.ids.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connects to the backend. Any failure is reported as
    /// [`VoiceError::BackendUnavailable`].
    pub async fn initialize(&mut self) -> Result<(), VoiceError> {
        if self.state != SessionState::Created {
            return Err(VoiceError::InvalidState {
                state: self.state.as_str(),
                operation: "initialize",
            });
        }

        match self.service.open_session(&self.ids).await {
            Ok(backend) => {
                self.backend = Some(backend);
                self.state = SessionState::Initialized;
                debug!(
                    session_id = %self.ids.session_id,
                    backend = self.service.backend_name(),
                    "voice backend connected"
                );
                Ok(())
            }
            Err(VoiceError::BackendUnavailable(reason)) => {
                Err(VoiceError::BackendUnavailable(reason))
            }
            Err(other) => Err(VoiceError::BackendUnavailable(other.to_string())),
        }
    }

    pub async fn start(&mut self) -> Result<(), VoiceError> {
        let backend = match (self.state, self.backend.as_mut()) {
            (SessionState::Initialized, Some(backend)) => backend,
            _ => {
                return Err(VoiceError::InvalidState {
                    state: self.state.as_str(),
                    operation: "start",
                })
            }
        };
        backend.start().await?;
        self.state = SessionState::Active;
        info!(session_id = %self.ids.session_id, "voice session active");
        Ok(())
    }

    /// Forwards one audio chunk.
    ///
    /// Chunks without data and chunks the backend rejects as invalid audio
    /// are logged and dropped; only backend failures are returned.
    pub async fn process_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), VoiceError> {
        if chunk.data.trim().is_empty() {
            warn!(session_id = %self.ids.session_id, "audio_chunk without data; dropping");
            return Ok(());
        }

        let backend = active_backend(self.state, &mut self.backend, "process audio")?;
        match backend.process_audio_chunk(chunk).await {
            Err(VoiceError::InvalidAudio(reason)) => {
                warn!(
                    session_id = %self.ids.session_id,
                    %reason,
                    "dropping invalid audio chunk"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Forwards an out-of-band instruction. An empty command is dropped.
    pub async fn handle_control(
        &mut self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<(), VoiceError> {
        if command.trim().is_empty() {
            warn!(session_id = %self.ids.session_id, "control message without command; dropping");
            return Ok(());
        }

        let backend = active_backend(self.state, &mut self.backend, "handle control")?;
        backend.handle_control(command, &params).await
    }

    /// Takes the backend's output stream. Available once per session.
    pub fn output_messages(&mut self) -> Result<OutputStream, VoiceError> {
        let backend = match (self.state, self.backend.as_mut()) {
            (SessionState::Initialized | SessionState::Active, Some(backend)) => backend,
            _ => {
                return Err(VoiceError::InvalidState {
                    state: self.state.as_str(),
                    operation: "take output",
                })
            }
        };
        backend.take_output().ok_or(VoiceError::OutputTaken)
    }

    /// Releases the backend. Repeated calls are no-ops and teardown errors
    /// are logged, never returned.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = SessionState::Stopped;

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.stop().await {
                warn!(
                    session_id = %self.ids.session_id,
                    error = %e,
                    "error stopping voice backend during cleanup"
                );
            }
        }
        info!(session_id = %self.ids.session_id, "voice session stopped");
    }
}

fn active_backend<'a>(
    state: SessionState,
    backend: &'a mut Option<Box<dyn BackendSession>>,
    operation: &'static str,
) -> Result<&'a mut Box<dyn BackendSession>, VoiceError> {
    match (state, backend.as_mut()) {
        (SessionState::Active, Some(backend)) => Ok(backend),
        _ => Err(VoiceError::InvalidState {
            state: state.as_str(),
            operation,
        }),
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        let session_id = std::mem::take(&mut self.ids.session_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.stop().await {
                        warn!(
                            session_id = %session_id,
                            error = %e,
                            "error stopping abandoned voice backend"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    "voice session dropped outside a runtime; backend not stopped"
                );
            }
        }
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("ids", &self.ids)
            .field("state", &self.state)
            .finish()
    }
}
