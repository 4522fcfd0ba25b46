//! BlueZ adapter via `bluer`.
//!
//! Scanning uses `discover_devices_with_changes`, so a device is re-reported
//! whenever BlueZ sees a fresh advertisement for it. Dropping the scan stream
//! ends the discovery session.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::future::{self, AbortHandle};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::{
    Advertisement, AdvertisementStream, BleAdapter, GattLink, NotificationStream,
};
use super::{BleError, BleResult};
use crate::codec::Payload;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// BLE adapter backed by the system BlueZ daemon.
pub struct BluerAdapter {
    _session: Session,
    adapter: Adapter,
    scan: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for BluerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluerAdapter")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluerAdapter {
    /// Open the default adapter and power it on.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::AdapterUnavailable`] when BlueZ or the adapter is missing.
    pub async fn new() -> BleResult<Self> {
        let session = Session::new().await.map_err(|e| {
            warn!(error = %e, "Could not open BlueZ session");
            BleError::AdapterUnavailable
        })?;
        let adapter = session.default_adapter().await.map_err(|e| {
            warn!(error = %e, "No default Bluetooth adapter");
            BleError::AdapterUnavailable
        })?;
        adapter.set_powered(true).await.map_err(BleError::io)?;
        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            scan: Mutex::new(None),
        })
    }

    fn device(&self, peripheral_id: &str) -> BleResult<Device> {
        let address: Address = peripheral_id
            .parse()
            .map_err(|_| BleError::PeripheralNotFound {
                id: peripheral_id.to_string(),
            })?;
        self.adapter
            .device(address)
            .map_err(|_| BleError::PeripheralNotFound {
                id: peripheral_id.to_string(),
            })
    }
}

async fn describe(adapter: &Adapter, address: Address) -> BleResult<Advertisement> {
    let device = adapter.device(address).map_err(BleError::io)?;
    let name = device.name().await.map_err(BleError::io)?;
    let rssi = device.rssi().await.ok().flatten();
    // BlueZ folds the advertised local name into `Name`.
    Ok(Advertisement {
        id: address.to_string(),
        name,
        local_name: None,
        rssi,
    })
}

#[async_trait]
impl BleAdapter for BluerAdapter {
    async fn start_scan(&self) -> BleResult<AdvertisementStream> {
        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(BleError::io)?;

        let adapter = self.adapter.clone();
        let adverts = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => Some(describe(&adapter, address).await),
                    _ => None,
                }
            }
        });

        let (adverts, abort) = stream::abortable(adverts);
        if let Some(previous) = lock(&self.scan).replace(abort) {
            previous.abort();
        }
        debug!("BlueZ discovery started");
        Ok(adverts.boxed())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        if let Some(abort) = lock(&self.scan).take() {
            abort.abort();
            debug!("BlueZ discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> BleResult<Arc<dyn GattLink>> {
        let device = self.device(peripheral_id)?;
        let already = device.is_connected().await.unwrap_or(false);
        if !already {
            device
                .connect()
                .await
                .map_err(|e| BleError::ConnectFailed {
                    id: peripheral_id.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(Arc::new(BluerLink {
            id: peripheral_id.to_string(),
            device,
        }))
    }

    async fn cancel_connection(&self, peripheral_id: &str) -> BleResult<()> {
        self.device(peripheral_id)?
            .disconnect()
            .await
            .map_err(BleError::io)
    }
}

struct BluerLink {
    id: String,
    device: Device,
}

impl BluerLink {
    async fn service(&self, uuid: Uuid) -> BleResult<Service> {
        for service in self.device.services().await.map_err(BleError::io)? {
            if service.uuid().await.map_err(BleError::io)? == uuid {
                return Ok(service);
            }
        }
        Err(BleError::ServiceNotFound {
            id: self.id.clone(),
            uuid,
        })
    }

    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> BleResult<Characteristic> {
        let service = self.service(service).await?;
        for characteristic in service.characteristics().await.map_err(BleError::io)? {
            if characteristic.uuid().await.map_err(BleError::io)? == uuid {
                return Ok(characteristic);
            }
        }
        Err(BleError::CharacteristicNotFound { uuid })
    }
}

#[async_trait]
impl GattLink for BluerLink {
    fn peripheral_id(&self) -> &str {
        &self.id
    }

    async fn discover(&self, service: Uuid) -> BleResult<Vec<Uuid>> {
        let service = self.service(service).await?;
        let mut uuids = Vec::new();
        for characteristic in service.characteristics().await.map_err(BleError::io)? {
            uuids.push(characteristic.uuid().await.map_err(BleError::io)?);
        }
        Ok(uuids)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> BleResult<Payload> {
        let characteristic = self.characteristic(service, characteristic).await?;
        let value = characteristic.read().await.map_err(BleError::io)?;
        Ok(Payload::from_raw(&value))
    }

    async fn write_with_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Payload,
    ) -> BleResult<()> {
        let characteristic = self.characteristic(service, characteristic).await?;
        let request = CharacteristicWriteRequest {
            op_type: WriteOp::Request,
            ..Default::default()
        };
        characteristic
            .write_ext(&value.to_raw()?, &request)
            .await
            .map_err(BleError::io)
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> BleResult<NotificationStream> {
        let characteristic = self.characteristic(service, characteristic).await?;
        let values = characteristic.notify().await.map_err(BleError::io)?;
        Ok(values.map(|value| Ok(Payload::from_raw(&value))).boxed())
    }

    async fn disconnect(&self) -> BleResult<()> {
        self.device.disconnect().await.map_err(BleError::io)
    }

    async fn closed(&self) {
        let mut events = match self.device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!(id = %self.id, error = %e, "Cannot watch device events");
                future::pending::<()>().await;
                return;
            }
        };
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                debug!(id = %self.id, "BlueZ reports link down");
                return;
            }
        }
    }
}
