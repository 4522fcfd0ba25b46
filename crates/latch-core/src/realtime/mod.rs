//! Realtime lock status over a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//!   RealtimeChannel ──connect──▶ SocketConnector ──▶ SocketConnection
//!        │   ▲                     (tungstenite | in-memory)
//!        │   └── schedule_reconnect ◀── error / close
//!        │
//!        ├── LockBackend::fetch_status  (seed on open)
//!        └── LockStateCell::apply       (status pushes)
//! ```
//!
//! ## Modules
//!
//! - [`backoff`] - Reconnect delay as a pure function of attempt count
//! - [`message`] - Wire messages and socket URL derivation
//! - [`transport`] - Socket traits and the tungstenite implementation
//! - [`channel`] - The channel state machine

use thiserror::Error;

pub mod backoff;
pub mod channel;
pub mod message;
pub mod transport;

pub use backoff::{Backoff, ReconnectState};
pub use channel::{ChannelPhase, LockBackend, RealtimeChannel};
pub use message::{ClientMessage, ServerMessage};
pub use transport::{SocketConnection, SocketConnector, TungsteniteConnector};

/// Errors from the realtime channel.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The backend base URL cannot produce a socket URL.
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// Offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The base URL is neither http nor https.
    #[error("Unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    /// Opening the socket failed.
    #[error("Socket connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("Socket send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("Socket receive failed: {0}")]
    Receive(String),
}

/// Result alias for realtime operations.
pub type RealtimeResult<T> = std::result::Result<T, RealtimeError>;
