//! Doorlock GATT protocol.
//!
//! One primary service with four characteristics. All values are ASCII text
//! (see [`crate::codec`]).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

/// Doorlock primary service.
pub const SERVICE_UUID: Uuid = uuid!("12345678-1234-1234-1234-1234567890ab");

/// Command characteristic (write with response).
pub const COMMAND_CHAR_UUID: Uuid = uuid!("12345678-1234-1234-1234-1234567890ac");

/// Lock-state characteristic (read, notify). Carries `LOCKED` / `UNLOCKED`.
pub const LOCK_STATE_CHAR_UUID: Uuid = uuid!("12345678-1234-1234-1234-1234567890ad");

/// MAC address characteristic (read).
pub const MAC_ADDRESS_CHAR_UUID: Uuid = uuid!("12345678-1234-1234-1234-1234567890ae");

/// Status LED color characteristic (notify). Single-character code.
pub const COLOR_CHAR_UUID: Uuid = uuid!("19b10001-e8f2-537e-4f6c-d104768a1217");

/// Advertised-name fragment identifying doorlocks.
pub const DEFAULT_NAME_FILTER: &str = "lock";

/// Commands understood by the lock firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockCommand {
    /// Throw the bolt.
    Lock,
    /// Retract the bolt.
    Unlock,
}

impl LockCommand {
    /// Wire spelling, used both over BLE and in the HTTP command path.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Unlock => "UNLOCK",
        }
    }
}

impl std::fmt::Display for LockCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LockCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOCK" => Ok(Self::Lock),
            "UNLOCK" => Ok(Self::Unlock),
            other => Err(format!("unknown lock command '{other}'")),
        }
    }
}

/// Status LED color reported on the color characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    /// Default when the code is not recognised.
    #[default]
    White,
    /// Code `B`.
    Blue,
    /// Code `R`.
    Red,
    /// Code `G`.
    Green,
}

impl LedColor {
    /// Decode a color code. Unknown codes map to [`LedColor::White`].
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "B" => Self::Blue,
            "R" => Self::Red,
            "G" => Self::Green,
            _ => Self::White,
        }
    }
}

/// Wi-Fi provisioning blob written to the command characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    /// Network name.
    pub ssid: String,
    /// Network passphrase.
    pub password: String,
}

/// Backend endpoint provisioning blob written to the command characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendEndpoint {
    /// Base URL the lock should report to.
    pub backend_base_url: String,
}

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address regex is valid")
});

/// Validate a colon-separated Bluetooth MAC address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Whether an advertised name identifies a doorlock.
///
/// Case-insensitive substring match; an empty filter matches everything.
#[must_use]
pub fn name_matches(name: &str, filter: &str) -> bool {
    name.to_lowercase().contains(&filter.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_spelling() {
        assert_eq!(LockCommand::Lock.as_str(), "LOCK");
        assert_eq!(LockCommand::Unlock.to_string(), "UNLOCK");
        assert_eq!("unlock".parse::<LockCommand>(), Ok(LockCommand::Unlock));
        assert!("open".parse::<LockCommand>().is_err());
    }

    #[test]
    fn test_led_color_codes() {
        assert_eq!(LedColor::from_code("B"), LedColor::Blue);
        assert_eq!(LedColor::from_code("R"), LedColor::Red);
        assert_eq!(LedColor::from_code("G"), LedColor::Green);
        assert_eq!(LedColor::from_code("b"), LedColor::White);
        assert_eq!(LedColor::from_code(""), LedColor::White);
    }

    #[test]
    fn test_provisioning_json_shape() {
        let wifi = WifiCredentials {
            ssid: "home".into(),
            password: "secret".into(),
        };
        assert_eq!(
            serde_json::to_string(&wifi).unwrap(),
            r#"{"ssid":"home","password":"secret"}"#
        );

        let backend = BackendEndpoint {
            backend_base_url: "http://10.0.0.2:8000/".into(),
        };
        assert_eq!(
            serde_json::to_string(&backend).unwrap(),
            r#"{"backendBaseUrl":"http://10.0.0.2:8000/"}"#
        );
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("5C:56:77:40:C8:6C"));
        assert!(is_valid_mac_address("d0:db:64:a8:43:20"));
        assert!(!is_valid_mac_address("5C:56:77:40:C8"));
        assert!(!is_valid_mac_address("5C-56-77-40-C8-6C"));
    }

    #[test]
    fn test_name_filter_is_case_insensitive() {
        assert!(name_matches("SmartLock_C86C", "lock"));
        assert!(name_matches("FRONT LOCK", "lock"));
        assert!(!name_matches("Kitchen Speaker", "lock"));
    }
}
