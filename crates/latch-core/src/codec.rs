//! Characteristic payload codec.
//!
//! Characteristic values travel as base64 text: the command strings and JSON
//! blobs the lock understands are ASCII, and the platform characteristic I/O
//! wants a transport-safe encoding of them.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Errors raised when turning a payload back into raw bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is not valid base64.
    #[error("payload is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A base64-encoded characteristic value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(String);

impl Payload {
    /// Wrap an already-encoded value as received from the platform.
    #[must_use]
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode raw characteristic bytes.
    #[must_use]
    pub fn from_raw(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    /// Decode to the raw characteristic bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidBase64`] if the payload is not base64.
    pub fn to_raw(&self) -> Result<Vec<u8>, CodecError> {
        Ok(STANDARD.decode(&self.0)?)
    }

    /// The encoded text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode a command or JSON blob for a characteristic write.
#[must_use]
pub fn encode(text: &str) -> Payload {
    Payload::from_raw(text.as_bytes())
}

/// Decode a characteristic value to text.
///
/// Absent, non-base64 or non-UTF-8 payloads decode to the empty string.
#[must_use]
pub fn decode(payload: Option<&Payload>) -> String {
    payload
        .and_then(|p| p.to_raw().ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}
