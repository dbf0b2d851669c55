//! Registry of active voice sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Errors returned by [`SessionRegistry::register`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already active")]
    AlreadyActive(String),
}

/// What the registry knows about one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub started_at: DateTime<Utc>,
}

type SessionMap = HashMap<String, ActiveSession>;

/// Process-local map of `session_id` to the metadata of its live session.
///
/// The `VoiceSession` itself stays owned by its connection task, which needs
/// it mutably; the registry only answers "is this id taken" and feeds
/// `GET /api/voice/sessions`.
///
/// Uses `std::sync::RwLock`: every acquisition is a brief map operation that
/// never spans an `.await`.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            tracing::error!("session registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            tracing::error!("session registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Registers a session, refusing a `session_id` that is already live.
    ///
    /// The returned lease removes the entry when dropped, so deregistration
    /// happens exactly once on every exit path of the owning task.
    pub fn register(
        &self,
        session_id: &str,
        user_id: &str,
        chat_id: &str,
    ) -> Result<SessionLease, RegistryError> {
        use std::collections::hash_map::Entry;

        let mut sessions = self.write();
        match sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyActive(session_id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(ActiveSession {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    chat_id: chat_id.to_string(),
                    started_at: Utc::now(),
                });
                Ok(SessionLease {
                    registry: self.clone(),
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<ActiveSession> {
        self.read().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of all active sessions, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<ActiveSession> = self.read().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    fn remove(&self, session_id: &str) -> bool {
        self.write().remove(session_id).is_some()
    }
}

/// Ownership of one registry entry.
#[derive(Debug)]
pub struct SessionLease {
    registry: SessionRegistry,
    session_id: String,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.registry.remove(&self.session_id) {
            tracing::warn!(
                session_id = %self.session_id,
                "session was already absent from the registry at release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_drop_removes_entry() {
        let registry = SessionRegistry::new();
        let lease = registry.register("s1", "u1", "c1").unwrap();
        assert!(registry.contains("s1"));
        assert_eq!(lease.session_id(), "s1");

        drop(lease);
        assert!(!registry.contains("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_session_id_is_refused_without_touching_the_original() {
        let registry = SessionRegistry::new();
        let _lease = registry.register("s1", "u1", "c1").unwrap();

        let err = registry.register("s1", "u2", "c2").unwrap_err();
        assert_eq!(err, RegistryError::AlreadyActive("s1".to_string()));

        let entry = registry.get("s1").unwrap();
        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.chat_id, "c1");
    }

    #[test]
    fn session_id_can_be_reused_after_release() {
        let registry = SessionRegistry::new();
        drop(registry.register("s1", "u1", "c1").unwrap());
        let _lease = registry.register("s1", "u1", "c1").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_lists_every_active_session() {
        let registry = SessionRegistry::new();
        let _a = registry.register("a", "u1", "c1").unwrap();
        let _b = registry.register("b", "u2", "c2").unwrap();

        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }
}
