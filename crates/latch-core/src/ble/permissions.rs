//! Runtime permission acquisition.
//!
//! What must be asked depends on the platform. Android before API 31 needs
//! fine location only; from API 31 on it needs the scan and connect
//! permissions as well. Other platforms need nothing at runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Host platform, as far as permissions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "os", rename_all = "lowercase")]
pub enum Platform {
    /// Android with its SDK level.
    Android {
        /// `Build.VERSION.SDK_INT`.
        api_level: u32,
    },
    /// iOS grants Bluetooth access through the system prompt on first use.
    Ios,
    /// Desktop stacks need no runtime grant.
    Desktop,
}

/// API level that introduced the split Bluetooth permissions.
pub const ANDROID_SPLIT_PERMISSIONS_API: u32 = 31;

/// A runtime permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// `BLUETOOTH_SCAN`
    BluetoothScan,
    /// `BLUETOOTH_CONNECT`
    BluetoothConnect,
    /// `ACCESS_FINE_LOCATION`
    FineLocation,
}

impl Permission {
    /// Platform identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BluetoothScan => "android.permission.BLUETOOTH_SCAN",
            Self::BluetoothConnect => "android.permission.BLUETOOTH_CONNECT",
            Self::FineLocation => "android.permission.ACCESS_FINE_LOCATION",
        }
    }
}

/// Outcome of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// Granted.
    Granted,
    /// Refused this time.
    Denied,
    /// Refused permanently.
    NeverAskAgain,
}

/// Explanation shown alongside a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rationale {
    /// Dialog title.
    pub title: &'static str,
    /// Dialog body.
    pub message: &'static str,
    /// Confirm button label.
    pub button_positive: &'static str,
}

/// The rationale attached to every request.
pub const LOCATION_RATIONALE: Rationale = Rationale {
    title: "Location Permission",
    message: "Bluetooth Low Energy requires Location",
    button_positive: "OK",
};

/// Something able to ask the user for a permission.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    /// Ask for one permission.
    async fn request(&self, permission: Permission, rationale: &Rationale) -> PermissionStatus;
}

/// Prompt that grants everything; for platforms without runtime grants.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionPrompt for AlwaysGranted {
    async fn request(&self, _permission: Permission, _rationale: &Rationale) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

/// Permissions to request, in request order.
#[must_use]
pub fn required_permissions(platform: Platform) -> Vec<Permission> {
    match platform {
        Platform::Android { api_level } if api_level < ANDROID_SPLIT_PERMISSIONS_API => {
            vec![Permission::FineLocation]
        }
        Platform::Android { .. } => vec![
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ],
        Platform::Ios | Platform::Desktop => Vec::new(),
    }
}

/// Request every required permission; `true` only if all were granted.
///
/// Every permission is asked even after a refusal.
pub async fn request_permissions(platform: Platform, prompt: &dyn PermissionPrompt) -> bool {
    let mut all_granted = true;
    for permission in required_permissions(platform) {
        let status = prompt.request(permission, &LOCATION_RATIONALE).await;
        if status == PermissionStatus::Granted {
            info!(permission = permission.as_str(), "Permission granted");
        } else {
            warn!(permission = permission.as_str(), ?status, "Permission not granted");
            all_granted = false;
        }
    }
    all_granted
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    struct ScriptedPrompt {
        answers: HashMap<Permission, PermissionStatus>,
        asked: Mutex<Vec<Permission>>,
    }

    impl ScriptedPrompt {
        fn new(answers: &[(Permission, PermissionStatus)]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PermissionPrompt for ScriptedPrompt {
        async fn request(&self, permission: Permission, rationale: &Rationale) -> PermissionStatus {
            assert_eq!(rationale.title, "Location Permission");
            self.asked.lock().unwrap().push(permission);
            self.answers
                .get(&permission)
                .copied()
                .unwrap_or(PermissionStatus::Granted)
        }
    }

    #[test]
    fn test_required_permissions_by_api_level() {
        assert_eq!(
            required_permissions(Platform::Android { api_level: 30 }),
            vec![Permission::FineLocation]
        );
        assert_eq!(
            required_permissions(Platform::Android { api_level: 31 }),
            vec![
                Permission::BluetoothScan,
                Permission::BluetoothConnect,
                Permission::FineLocation
            ]
        );
        assert!(required_permissions(Platform::Ios).is_empty());
        assert!(required_permissions(Platform::Desktop).is_empty());
    }

    #[tokio::test]
    async fn test_all_granted() {
        let prompt = ScriptedPrompt::new(&[]);
        assert!(request_permissions(Platform::Android { api_level: 33 }, &prompt).await);
        assert_eq!(prompt.asked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_one_refusal_fails_but_all_are_asked() {
        let prompt = ScriptedPrompt::new(&[(
            Permission::BluetoothScan,
            PermissionStatus::NeverAskAgain,
        )]);
        assert!(!request_permissions(Platform::Android { api_level: 33 }, &prompt).await);
        assert_eq!(
            *prompt.asked.lock().unwrap(),
            vec![
                Permission::BluetoothScan,
                Permission::BluetoothConnect,
                Permission::FineLocation
            ]
        );
    }

    #[tokio::test]
    async fn test_legacy_android_location_denied() {
        let prompt = ScriptedPrompt::new(&[(Permission::FineLocation, PermissionStatus::Denied)]);
        assert!(!request_permissions(Platform::Android { api_level: 29 }, &prompt).await);
    }

    #[tokio::test]
    async fn test_desktop_needs_nothing() {
        assert!(request_permissions(Platform::Desktop, &AlwaysGranted).await);
    }
}
