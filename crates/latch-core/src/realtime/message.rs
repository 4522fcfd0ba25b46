//! Relay wire format.
//!
//! Outbound: `{"type":"subscribe","deviceId":"..."}`.
//! Inbound: `{"type":"status","deviceId":"...","status":"LOCKED"|"UNLOCKED"}`;
//! every other message type is ignored.

use serde::{Deserialize, Serialize};
use url::Url;

use super::{RealtimeError, RealtimeResult};
use crate::lock_state::LockState;

/// Message sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start receiving status for one device.
    Subscribe {
        /// Device to follow.
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

impl ClientMessage {
    /// JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Message received from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A device reported its lock state.
    Status {
        /// Reporting device.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Raw status text.
        status: String,
    },
    /// Any other message type.
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid JSON or a malformed status message.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// The lock state this message carries for `device_id`, if any.
    #[must_use]
    pub fn status_for(&self, device_id: &str) -> Option<LockState> {
        match self {
            Self::Status {
                device_id: from,
                status,
            } if from == device_id => LockState::from_status(status),
            _ => None,
        }
    }
}

/// Derive the socket URL: `http` becomes `ws`, `https` becomes `wss`, then
/// `path` is appended to the base path.
///
/// # Errors
///
/// Returns an error for an unparseable base or a scheme other than http(s).
pub fn socket_url(base_url: &str, path: &str) -> RealtimeResult<Url> {
    let mut url = Url::parse(base_url).map_err(|e| RealtimeError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(RealtimeError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| RealtimeError::UnsupportedScheme(url.scheme().to_string()))?;

    if !url.path().ends_with('/') {
        let with_slash = format!("{}/", url.path());
        url.set_path(&with_slash);
    }
    url.join(path.trim_start_matches('/'))
        .map_err(|e| RealtimeError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_shape() {
        let msg = ClientMessage::Subscribe {
            device_id: "dev-1".into(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"subscribe","deviceId":"dev-1"}"#
        );
    }

    #[test]
    fn test_status_parsing() {
        let msg = ServerMessage::parse(r#"{"type":"status","deviceId":"X","status":"LOCKED"}"#)
            .unwrap();
        assert_eq!(msg.status_for("X"), Some(LockState::Locked));
        assert_eq!(msg.status_for("Y"), None);
    }

    #[test]
    fn test_unknown_status_and_types_are_ignored() {
        let jammed =
            ServerMessage::parse(r#"{"type":"status","deviceId":"X","status":"JAMMED"}"#).unwrap();
        assert_eq!(jammed.status_for("X"), None);

        let event = ServerMessage::parse(r#"{"type":"event","deviceId":"X"}"#).unwrap();
        assert_eq!(event, ServerMessage::Other);
        assert_eq!(event.status_for("X"), None);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"deviceId":"X"}"#).is_err());
    }

    #[test]
    fn test_socket_url_scheme_mapping() {
        assert_eq!(
            socket_url("http://127.0.0.1:8000/", "ws/client")
                .unwrap()
                .as_str(),
            "ws://127.0.0.1:8000/ws/client"
        );
        assert_eq!(
            socket_url("https://locks.example.com/api", "/ws/client")
                .unwrap()
                .as_str(),
            "wss://locks.example.com/api/ws/client"
        );
    }

    #[test]
    fn test_socket_url_rejects_other_schemes() {
        assert!(matches!(
            socket_url("ftp://example.com/", "ws/client"),
            Err(RealtimeError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            socket_url("not a url", "ws/client"),
            Err(RealtimeError::InvalidBaseUrl { .. })
        ));
    }
}
