//! Session persistence.
//!
//! The session carries the signed-in user (and through it the device to
//! follow) plus the bearer token. Stores are key-value collaborators: a
//! missing or unreadable session is simply "no session".

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from file-backed session storage.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No platform data directory could be determined.
    #[error("Cannot determine data directory")]
    NoDataDirectory,

    /// The session file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// Session file.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// The session file could not be written or removed.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Session file.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// The session could not be serialized.
    #[error("Failed to serialize session: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// The signed-in user as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Login email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Doorlock bound to this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Any other profile fields, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A persisted sign-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Signed-in user.
    #[serde(default)]
    pub user: Option<SessionUser>,
    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Refresh token, when the backend issues one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Session {
    /// The device bound to the user, if set and non-empty.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|user| user.device_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Key-value session storage.
pub trait SessionStore: Send + Sync {
    /// The stored session, if any.
    fn get_session(&self) -> Option<Session>;

    /// Replace the stored session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be persisted.
    fn set_session(&self, session: &Session) -> Result<(), SessionError>;

    /// Remove the stored session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be removed.
    fn clear_session(&self) -> Result<(), SessionError>;
}

/// Process-local session storage.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    /// Store pre-seeded with `session`.
    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: &Session) -> Result<(), SessionError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear_session(&self) -> Result<(), SessionError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Session stored as JSON on disk.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store backed by `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store in the platform data directory, e.g. `~/.local/share/latch/session.json`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoDataDirectory`] if none can be determined.
    pub fn default_location() -> Result<Self, SessionError> {
        let dirs = directories::ProjectDirs::from("", "", "latch")
            .ok_or(SessionError::NoDataDirectory)?;
        Ok(Self::new(dirs.data_dir().join("session.json")))
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read(&self) -> Result<Option<Session>, SessionError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| SessionError::ReadError {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl SessionStore for FileSessionStore {
    fn get_session(&self) -> Option<Session> {
        match self.read() {
            Ok(session) => session,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable session");
                None
            }
        }
    }

    fn set_session(&self, session: &Session) -> Result<(), SessionError> {
        let write_error = |source| SessionError::WriteError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, content).map_err(write_error)?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    fn clear_session(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionError::WriteError {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(device_id: Option<&str>) -> Session {
        Session {
            user: Some(SessionUser {
                email: Some("owner@example.com".into()),
                device_id: device_id.map(str::to_string),
                extra: Map::new(),
            }),
            token: Some("tok".into()),
            refresh_token: None,
        }
    }

    #[test]
    fn test_device_id_from_user() {
        assert_eq!(session(Some("smartlock_1")).device_id(), Some("smartlock_1"));
        assert_eq!(session(Some("")).device_id(), None);
        assert_eq!(session(None).device_id(), None);
        assert_eq!(Session::default().device_id(), None);
    }

    #[test]
    fn test_user_keeps_unknown_fields() {
        let user: SessionUser = serde_json::from_str(
            r#"{"email":"a@b.c","device_id":"d1","firstName":"Ada","role":"owner"}"#,
        )
        .unwrap();
        assert_eq!(user.device_id.as_deref(), Some("d1"));
        assert_eq!(user.extra.get("role"), Some(&Value::from("owner")));

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["firstName"], "Ada");
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::default();
        assert!(store.get_session().is_none());
        store.set_session(&session(Some("d1"))).unwrap();
        assert_eq!(store.get_session().unwrap().device_id(), Some("d1"));
        store.clear_session().unwrap();
        assert!(store.get_session().is_none());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));
        assert!(store.get_session().is_none());

        store.set_session(&session(Some("d1"))).unwrap();
        assert_eq!(store.get_session(), Some(session(Some("d1"))));

        store.clear_session().unwrap();
        assert!(store.get_session().is_none());
        store.clear_session().unwrap();
    }

    #[test]
    fn test_file_store_unreadable_is_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ definitely not json").unwrap();
        assert!(FileSessionStore::new(path).get_session().is_none());
    }
}
