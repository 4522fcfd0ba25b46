//! # latch-core
//!
//! Device connectivity core for the latch smart doorlock client.
//!
//! This crate provides:
//! - Bluetooth Low Energy discovery, a single managed connection and
//!   characteristic I/O against the doorlock's GATT service
//! - A realtime WebSocket channel that follows one device's lock status with
//!   exponential-backoff reconnects
//! - An HTTP client for status, remote commands, sign-in and device settings
//! - A merged lock state fed by all three transports
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`context`] - `LockContext`, the composition root
//! - [`ble`] - Adapter traits, session manager, permissions, protocol constants
//! - [`registry`] - Discovered-peripheral registry with TTL pruning
//! - [`realtime`] - Realtime status channel and reconnect policy
//! - [`backend`] - HTTP backend client
//! - [`lock_state`] - Merged lock state cell
//! - [`codec`] - Text/base64 payload codec for characteristic values
//! - [`session`] - Session persistence
//! - [`config`] - Configuration loading, saving and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod backend;
pub mod ble;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod lock_state;
pub mod realtime;
pub mod registry;
pub mod session;

// Re-export primary types for convenience
pub use backend::{BackendClient, BackendError, DeviceSettings, SettingKey, SignUpRequest};
pub use ble::adapter::{Advertisement, BleAdapter, GattLink};
pub use ble::mock::{MockAdapter, MockPeripheral};
pub use ble::permissions::{Permission, PermissionPrompt, PermissionStatus, Platform};
pub use ble::protocol::{is_valid_mac_address, LedColor, LockCommand};
pub use ble::{BleError, BleSessionManager, ConnectionHandle, ConnectionPhase, Subscription};
pub use config::{ConfigError, LatchConfig};
pub use context::{CommandDispatch, LockContext};
pub use error::{LatchError, Result};
pub use lock_state::{LockState, LockStateCell, LockUpdate, UpdateSource};
pub use realtime::{ChannelPhase, LockBackend, RealtimeChannel, RealtimeError, TungsteniteConnector};
pub use registry::{DeviceRegistry, PeripheralRecord};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionStore};
