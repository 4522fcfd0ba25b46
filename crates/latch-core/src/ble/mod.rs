//! Bluetooth Low Energy session layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  BleSessionManager                    │
//! │   (single connection, feeds, commands, permissions)   │
//! └───────────────┬────────────────────┬─────────────────┘
//!                 │                    │
//!                 ▼                    ▼
//!        ┌────────────────┐   ┌─────────────────┐
//!        │   Discovery    │   │    GattLink     │
//!        │ (registry+TTL) │   │ (one peripheral)│
//!        └───────┬────────┘   └────────┬────────┘
//!                └──────── BleAdapter ─┘
//!                   bluer │ mock
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service/characteristic UUIDs, commands, color codes
//! - [`adapter`] - `BleAdapter` / `GattLink` transport traits
//! - [`permissions`] - Runtime permission acquisition
//! - [`session`] - The session manager
//! - [`mock`] - In-memory adapter
//! - `bluer_backend` - BlueZ adapter (feature `bluetooth`)

use thiserror::Error;

use crate::codec::CodecError;

pub mod adapter;
#[cfg(feature = "bluetooth")]
pub mod bluer_backend;
pub mod mock;
pub mod permissions;
pub mod protocol;
pub mod session;

pub use adapter::{Advertisement, BleAdapter, GattLink};
pub use permissions::{Permission, PermissionPrompt, PermissionStatus, Platform};
pub use protocol::{LedColor, LockCommand};
pub use session::{
    BleSessionManager, CharacteristicIds, ConnectionHandle, ConnectionPhase, Subscription,
};

/// Errors from the BLE stack.
#[derive(Debug, Error)]
pub enum BleError {
    /// No radio/adapter could be obtained.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// A runtime permission was refused.
    #[error("Permission '{permission}' was not granted")]
    PermissionDenied {
        /// Permission name.
        permission: String,
    },

    /// No peripheral is connected.
    #[error("No device connected")]
    NotConnected,

    /// The peripheral is unknown to the adapter.
    #[error("Peripheral '{id}' not found")]
    PeripheralNotFound {
        /// Peripheral id.
        id: String,
    },

    /// The lock service is missing on the peripheral.
    #[error("Service {uuid} not found on '{id}'")]
    ServiceNotFound {
        /// Peripheral id.
        id: String,
        /// Service UUID.
        uuid: uuid::Uuid,
    },

    /// A characteristic is missing from the service.
    #[error("Characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// Characteristic UUID.
        uuid: uuid::Uuid,
    },

    /// Opening the connection failed.
    #[error("Failed to connect to '{id}': {message}")]
    ConnectFailed {
        /// Peripheral id.
        id: String,
        /// Underlying failure.
        message: String,
    },

    /// Any other stack-level failure.
    #[error("Bluetooth I/O error: {message}")]
    Io {
        /// Underlying failure.
        message: String,
    },

    /// Payload could not be converted.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result alias for BLE operations.
pub type BleResult<T> = std::result::Result<T, BleError>;

impl BleError {
    /// Wrap any displayable stack error.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}
