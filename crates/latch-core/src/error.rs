//! Unified error types for the latch core library.
//!
//! This module provides a unified error type [`LatchError`] that covers all failure
//! modes across the connectivity layer. Each module also has its own specific error
//! type (`BleError`, `RealtimeError`, `BackendError`, `ConfigError`, `SessionError`)
//! for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **Degrade, don't raise**: Transport failures are classified so callers can
//!   turn them into neutral results instead of surfacing them to the user
//!
//! # Example
//!
//! ```rust
//! use latch_core::error::{LatchError, Result};
//!
//! fn require_device(device_id: Option<&str>) -> Result<&str> {
//!     device_id.ok_or(LatchError::NoDeviceSelected)
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all latch operations.
#[derive(Debug, Error)]
pub enum LatchError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter is available to this process.
    #[error("Bluetooth adapter unavailable. Ensure Bluetooth is enabled and the radio is present.")]
    BluetoothUnavailable,

    /// The user (or platform) refused one of the required runtime permissions.
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    /// An operation needed a connected peripheral but there is none.
    #[error("No doorlock connected over Bluetooth")]
    NotConnected,

    /// Connecting to or discovering a peripheral failed.
    #[error("Bluetooth connection to '{id}' failed: {message}")]
    ConnectionFailed {
        /// Peripheral id.
        id: String,
        /// Underlying failure.
        message: String,
    },

    /// A characteristic read, write or subscription failed.
    #[error("Characteristic I/O failed: {0}")]
    CharacteristicIo(String),

    // =========================================================================
    // REALTIME & BACKEND ERRORS
    // =========================================================================
    /// The realtime socket could not be opened or broke.
    #[error("Realtime channel error: {0}")]
    ChannelFailed(String),

    /// The backend could not be reached (network error or timeout).
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend answered with a non-success status.
    #[error("Backend rejected request ({status}): {detail}")]
    BackendRejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided detail or a default message.
        detail: String,
    },

    /// A message or payload could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No lock device id is known for the current session.
    #[error("No lock device selected. Sign in or configure device.default_device_id.")]
    NoDeviceSelected,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading session data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for latch operations.
pub type Result<T> = std::result::Result<T, LatchError>;

impl LatchError {
    /// Returns `true` if this error is related to Bluetooth operations.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothUnavailable
                | Self::PermissionDenied(_)
                | Self::NotConnected
                | Self::ConnectionFailed { .. }
                | Self::CharacteristicIo(_)
        )
    }

    /// Returns `true` if the transport itself is missing or broken.
    ///
    /// These are the failures the connectivity layer turns into logged no-ops.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothUnavailable
                | Self::NotConnected
                | Self::ChannelFailed(_)
                | Self::BackendUnreachable(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying later may succeed without user intervention.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelFailed(_) | Self::BackendUnreachable(_) | Self::ConnectionFailed { .. }
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothUnavailable => "BLUETOOTH_UNAVAILABLE",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::CharacteristicIo(_) => "CHARACTERISTIC_IO",
            Self::ChannelFailed(_) => "CHANNEL_FAILED",
            Self::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            Self::BackendRejected { .. } => "BACKEND_REJECTED",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::NoDeviceSelected => "NO_DEVICE_SELECTED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for LatchError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::ble::BleError> for LatchError {
    fn from(err: crate::ble::BleError) -> Self {
        use crate::ble::BleError;
        match err {
            BleError::AdapterUnavailable => Self::BluetoothUnavailable,
            BleError::PermissionDenied { permission } => Self::PermissionDenied(permission),
            BleError::NotConnected => Self::NotConnected,
            BleError::PeripheralNotFound { id } => Self::ConnectionFailed {
                id,
                message: "peripheral not found".into(),
            },
            BleError::ServiceNotFound { id, uuid } => Self::ConnectionFailed {
                id,
                message: format!("service {uuid} not found"),
            },
            BleError::CharacteristicNotFound { uuid } => {
                Self::CharacteristicIo(format!("characteristic {uuid} not found"))
            }
            BleError::ConnectFailed { id, message } => Self::ConnectionFailed { id, message },
            BleError::Io { message } => Self::CharacteristicIo(message),
            BleError::Codec(e) => Self::MalformedMessage(e.to_string()),
        }
    }
}

impl From<crate::realtime::RealtimeError> for LatchError {
    fn from(err: crate::realtime::RealtimeError) -> Self {
        use crate::realtime::RealtimeError;
        match err {
            RealtimeError::InvalidBaseUrl { url, reason } => {
                Self::ConfigValidationError(format!("backend.base_url '{url}': {reason}"))
            }
            RealtimeError::UnsupportedScheme(scheme) => Self::ConfigValidationError(format!(
                "backend.base_url scheme '{scheme}' must be http or https"
            )),
            RealtimeError::Connect(message)
            | RealtimeError::Send(message)
            | RealtimeError::Receive(message) => Self::ChannelFailed(message),
        }
    }
}

impl From<crate::backend::BackendError> for LatchError {
    fn from(err: crate::backend::BackendError) -> Self {
        use crate::backend::BackendError;
        match err {
            BackendError::InvalidUrl(e) => Self::ConfigValidationError(e.to_string()),
            BackendError::Request(e) => Self::BackendUnreachable(e.to_string()),
            BackendError::Timeout => Self::BackendUnreachable("Server unreachable".into()),
            BackendError::Rejected { status, detail } => Self::BackendRejected { status, detail },
            BackendError::MalformedResponse(message) => Self::MalformedMessage(message),
        }
    }
}

impl From<crate::session::SessionError> for LatchError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::NoDataDirectory => {
                Self::PersistenceError("Cannot determine data directory".into())
            }
            SessionError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {}", path.display(), source))
            }
            SessionError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            SessionError::SerializeError(e) => Self::PersistenceError(e.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_bluetooth_error_classification() {
        assert!(LatchError::BluetoothUnavailable.is_bluetooth_error());
        assert!(LatchError::NotConnected.is_bluetooth_error());
        assert!(LatchError::PermissionDenied("scan".into()).is_bluetooth_error());

        assert!(!LatchError::ChannelFailed("closed".into()).is_bluetooth_error());
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(LatchError::BluetoothUnavailable.is_transport_error());
        assert!(LatchError::ChannelFailed("reset".into()).is_transport_error());
        assert!(LatchError::BackendUnreachable("timeout".into()).is_transport_error());

        assert!(!LatchError::PermissionDenied("connect".into()).is_transport_error());
        assert!(!LatchError::MalformedMessage("bad json".into()).is_transport_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(LatchError::ChannelFailed("closed".into()).is_recoverable());
        assert!(LatchError::ConnectionFailed {
            id: "AA:01".into(),
            message: "timeout".into()
        }
        .is_recoverable());
        assert!(!LatchError::NoDeviceSelected.is_recoverable());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(LatchError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(LatchError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(!LatchError::NotConnected.is_config_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let latch_err: LatchError = io_err.into();
        assert!(matches!(latch_err, LatchError::IoError(_)));
        assert!(latch_err.is_io_error());
    }

    #[test]
    fn test_from_ble_error() {
        let err: LatchError = crate::ble::BleError::AdapterUnavailable.into();
        assert!(matches!(err, LatchError::BluetoothUnavailable));

        let err: LatchError = crate::ble::BleError::ConnectFailed {
            id: "AA:01".into(),
            message: "le-connection-abort-by-local".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert!(format!("{err}").contains("AA:01"));
    }

    #[test]
    fn test_from_backend_timeout() {
        let err: LatchError = crate::backend::BackendError::Timeout.into();
        assert!(err.is_transport_error());
        assert!(format!("{err}").contains("Server unreachable"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            LatchError::BluetoothUnavailable.error_code(),
            "BLUETOOTH_UNAVAILABLE"
        );
        assert_eq!(LatchError::NoDeviceSelected.error_code(), "NO_DEVICE_SELECTED");
        assert_eq!(
            LatchError::BackendRejected {
                status: 401,
                detail: "nope".into()
            }
            .error_code(),
            "BACKEND_REJECTED"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<LatchError>();
        assert_sync::<LatchError>();
    }
}
