//! Transport seam between the session manager and a concrete BLE stack.
//!
//! The manager only ever talks to these traits. The BlueZ backend lives in
//! [`super::bluer_backend`] (feature `bluetooth`); [`super::mock`] is the
//! in-memory stand-in.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use super::BleResult;
use crate::codec::Payload;

/// One advertisement heard while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Stable device address.
    pub id: String,
    /// GAP device name, if known.
    pub name: Option<String>,
    /// Name carried in the advertisement itself, if any.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Local name first, then device name, else empty.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.local_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.name.as_deref())
            .unwrap_or("")
    }
}

/// Stream of scan results; errors are per-advertisement and non-fatal.
pub type AdvertisementStream = BoxStream<'static, BleResult<Advertisement>>;

/// Stream of characteristic notifications.
pub type NotificationStream = BoxStream<'static, BleResult<Payload>>;

/// A radio able to scan and open connections.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Begin continuous scanning.
    async fn start_scan(&self) -> BleResult<AdvertisementStream>;

    /// Stop scanning. Stopping an idle adapter is not an error.
    async fn stop_scan(&self) -> BleResult<()>;

    /// Open a connection to a peripheral.
    async fn connect(&self, peripheral_id: &str) -> BleResult<Arc<dyn GattLink>>;

    /// Cancel a connection by peripheral id, whether or not this process holds a link to it.
    async fn cancel_connection(&self, peripheral_id: &str) -> BleResult<()>;
}

/// An open connection to one peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Address of the connected peripheral.
    fn peripheral_id(&self) -> &str;

    /// Discover a service; returns the UUIDs of its characteristics.
    async fn discover(&self, service: Uuid) -> BleResult<Vec<Uuid>>;

    /// Read a characteristic once.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> BleResult<Payload>;

    /// Write a characteristic and wait for the peripheral's acknowledgment.
    async fn write_with_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Payload,
    ) -> BleResult<()>;

    /// Subscribe to notifications on a characteristic.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid)
        -> BleResult<NotificationStream>;

    /// Close the connection.
    async fn disconnect(&self) -> BleResult<()>;

    /// Resolves once the peripheral has dropped the connection.
    async fn closed(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_prefers_local_name() {
        let adv = Advertisement {
            id: "AA:01".into(),
            name: Some("esp32".into()),
            local_name: Some("FrontLock".into()),
            rssi: None,
        };
        assert_eq!(adv.display_name(), "FrontLock");

        let adv = Advertisement {
            local_name: Some(String::new()),
            ..adv
        };
        assert_eq!(adv.display_name(), "esp32");

        let adv = Advertisement {
            name: None,
            local_name: None,
            ..adv
        };
        assert_eq!(adv.display_name(), "");
    }
}
