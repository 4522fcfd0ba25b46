//! In-memory BLE adapter.
//!
//! Peripherals are registered up front; scan results and notifications are
//! pushed by hand. The adapter keeps a log of link events so callers can check
//! how many connections were open at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use super::adapter::{
    Advertisement, AdvertisementStream, BleAdapter, GattLink, NotificationStream,
};
use super::protocol::{
    COLOR_CHAR_UUID, COMMAND_CHAR_UUID, LOCK_STATE_CHAR_UUID, MAC_ADDRESS_CHAR_UUID, SERVICE_UUID,
};
use super::{BleError, BleResult};
use crate::codec::{self, Payload};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A link lifecycle event recorded by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection was opened.
    Connected(String),
    /// A connection was closed from this side.
    Disconnected(String),
    /// The peripheral dropped the connection.
    Dropped(String),
    /// A connection was cancelled by id.
    Cancelled(String),
}

#[derive(Default)]
struct AdapterState {
    scan_tx: Option<UnboundedSender<BleResult<Advertisement>>>,
    peripherals: HashMap<String, MockPeripheral>,
    fail_connect: HashSet<String>,
    open: HashSet<String>,
    max_open: usize,
    events: Vec<LinkEvent>,
}

impl AdapterState {
    fn opened(&mut self, id: &str) {
        self.open.insert(id.to_string());
        self.max_open = self.max_open.max(self.open.len());
        self.events.push(LinkEvent::Connected(id.to_string()));
    }

    fn closed(&mut self, event: LinkEvent) {
        let id = match &event {
            LinkEvent::Connected(id)
            | LinkEvent::Disconnected(id)
            | LinkEvent::Dropped(id)
            | LinkEvent::Cancelled(id) => id.clone(),
        };
        self.open.remove(&id);
        self.events.push(event);
    }
}

/// In-memory [`BleAdapter`].
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<AdapterState>>,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockAdapter")
            .field("scanning", &state.scan_tx.is_some())
            .field("peripherals", &state.peripherals.len())
            .field("open", &state.open)
            .finish()
    }
}

impl MockAdapter {
    /// Empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a doorlock exposing the full lock service.
    pub fn add_lock(&self, id: &str) -> MockPeripheral {
        let peripheral = MockPeripheral::new(
            id,
            &[
                COMMAND_CHAR_UUID,
                LOCK_STATE_CHAR_UUID,
                MAC_ADDRESS_CHAR_UUID,
                COLOR_CHAR_UUID,
            ],
        );
        peripheral.set_value(LOCK_STATE_CHAR_UUID, "LOCKED");
        peripheral.set_value(MAC_ADDRESS_CHAR_UUID, id);
        lock(&self.state)
            .peripherals
            .insert(id.to_string(), peripheral.clone());
        peripheral
    }

    /// Register a peripheral that does not carry the lock service.
    pub fn add_foreign(&self, id: &str) -> MockPeripheral {
        let peripheral = MockPeripheral {
            inner: Arc::new(PeripheralInner::new(id, HashMap::new())),
        };
        lock(&self.state)
            .peripherals
            .insert(id.to_string(), peripheral.clone());
        peripheral
    }

    /// Make connections to `id` fail.
    pub fn fail_connect(&self, id: &str) {
        lock(&self.state).fail_connect.insert(id.to_string());
    }

    /// Deliver an advertisement to the running scan, if any.
    pub fn advertise(&self, advertisement: Advertisement) {
        if let Some(tx) = &lock(&self.state).scan_tx {
            let _ = tx.unbounded_send(Ok(advertisement));
        }
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan_tx.is_some()
    }

    /// Ids with an open link.
    #[must_use]
    pub fn open_links(&self) -> Vec<String> {
        let mut open: Vec<_> = lock(&self.state).open.iter().cloned().collect();
        open.sort();
        open
    }

    /// Highest number of simultaneously open links seen so far.
    #[must_use]
    pub fn max_open_links(&self) -> usize {
        lock(&self.state).max_open
    }

    /// Every link event in order.
    #[must_use]
    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.state).events.clone()
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn start_scan(&self) -> BleResult<AdvertisementStream> {
        let (tx, rx) = unbounded();
        lock(&self.state).scan_tx = Some(tx);
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        lock(&self.state).scan_tx = None;
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> BleResult<Arc<dyn GattLink>> {
        let mut state = lock(&self.state);
        if state.fail_connect.contains(peripheral_id) {
            return Err(BleError::ConnectFailed {
                id: peripheral_id.to_string(),
                message: "connection refused".into(),
            });
        }
        let peripheral = state
            .peripherals
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| BleError::PeripheralNotFound {
                id: peripheral_id.to_string(),
            })?;
        peripheral.inner.dropped.send_replace(false);
        state.opened(peripheral_id);
        Ok(Arc::new(MockLink {
            peripheral,
            adapter: Arc::clone(&self.state),
        }))
    }

    async fn cancel_connection(&self, peripheral_id: &str) -> BleResult<()> {
        let mut state = lock(&self.state);
        if !state.peripherals.contains_key(peripheral_id) {
            return Err(BleError::PeripheralNotFound {
                id: peripheral_id.to_string(),
            });
        }
        state.closed(LinkEvent::Cancelled(peripheral_id.to_string()));
        Ok(())
    }
}

struct PeripheralInner {
    id: String,
    services: HashMap<Uuid, Vec<Uuid>>,
    values: Mutex<HashMap<Uuid, Payload>>,
    writes: Mutex<Vec<(Uuid, Payload)>>,
    notifiers: Mutex<HashMap<Uuid, Vec<UnboundedSender<BleResult<Payload>>>>>,
    fail_disconnect: Mutex<bool>,
    fail_io: Mutex<bool>,
    dropped: watch::Sender<bool>,
}

impl PeripheralInner {
    fn new(id: &str, services: HashMap<Uuid, Vec<Uuid>>) -> Self {
        let (dropped, _rx) = watch::channel(false);
        Self {
            id: id.to_string(),
            services,
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            notifiers: Mutex::new(HashMap::new()),
            fail_disconnect: Mutex::new(false),
            fail_io: Mutex::new(false),
            dropped,
        }
    }
}

/// Handle on a registered peripheral, used to drive it from the outside.
#[derive(Clone)]
pub struct MockPeripheral {
    inner: Arc<PeripheralInner>,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl MockPeripheral {
    fn new(id: &str, characteristics: &[Uuid]) -> Self {
        let services = HashMap::from([(SERVICE_UUID, characteristics.to_vec())]);
        Self {
            inner: Arc::new(PeripheralInner::new(id, services)),
        }
    }

    /// Peripheral address.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Set the value returned by reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, text: &str) {
        lock(&self.inner.values).insert(characteristic, codec::encode(text));
    }

    /// Push a notification to every subscriber of `characteristic`.
    pub fn notify(&self, characteristic: Uuid, text: &str) {
        self.push(characteristic, Ok(codec::encode(text)));
    }

    /// Push a notification error to every subscriber of `characteristic`.
    pub fn notify_error(&self, characteristic: Uuid, message: &str) {
        self.push(characteristic, Err(BleError::io(message)));
    }

    fn push(&self, characteristic: Uuid, item: BleResult<Payload>) {
        let mut notifiers = lock(&self.inner.notifiers);
        if let Some(senders) = notifiers.get_mut(&characteristic) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let item = match &item {
                    Ok(payload) => Ok(payload.clone()),
                    Err(e) => Err(BleError::io(e)),
                };
                let _ = tx.unbounded_send(item);
            }
        }
    }

    /// Live subscribers on `characteristic`.
    #[must_use]
    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        lock(&self.inner.notifiers)
            .get(&characteristic)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Decoded writes in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(Uuid, String)> {
        lock(&self.inner.writes)
            .iter()
            .map(|(uuid, payload)| (*uuid, codec::decode(Some(payload))))
            .collect()
    }

    /// Make local disconnects fail.
    pub fn fail_disconnect(&self, fail: bool) {
        *lock(&self.inner.fail_disconnect) = fail;
    }

    /// Make reads and writes fail.
    pub fn fail_io(&self, fail: bool) {
        *lock(&self.inner.fail_io) = fail;
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, adapter: &MockAdapter) {
        lock(&self.inner.notifiers).clear();
        self.inner.dropped.send_replace(true);
        lock(&adapter.state).closed(LinkEvent::Dropped(self.inner.id.clone()));
    }

    fn check_io(&self) -> BleResult<()> {
        if *lock(&self.inner.fail_io) {
            Err(BleError::io("GATT operation failed"))
        } else {
            Ok(())
        }
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> BleResult<()> {
        let chars = self
            .inner
            .services
            .get(&service)
            .ok_or_else(|| BleError::ServiceNotFound {
                id: self.inner.id.clone(),
                uuid: service,
            })?;
        if chars.contains(&characteristic) {
            Ok(())
        } else {
            Err(BleError::CharacteristicNotFound {
                uuid: characteristic,
            })
        }
    }
}

struct MockLink {
    peripheral: MockPeripheral,
    adapter: Arc<Mutex<AdapterState>>,
}

#[async_trait]
impl GattLink for MockLink {
    fn peripheral_id(&self) -> &str {
        &self.peripheral.inner.id
    }

    async fn discover(&self, service: Uuid) -> BleResult<Vec<Uuid>> {
        self.peripheral
            .inner
            .services
            .get(&service)
            .cloned()
            .ok_or_else(|| BleError::ServiceNotFound {
                id: self.peripheral.inner.id.clone(),
                uuid: service,
            })
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> BleResult<Payload> {
        self.peripheral.characteristic(service, characteristic)?;
        self.peripheral.check_io()?;
        Ok(lock(&self.peripheral.inner.values)
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_with_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Payload,
    ) -> BleResult<()> {
        self.peripheral.characteristic(service, characteristic)?;
        self.peripheral.check_io()?;
        lock(&self.peripheral.inner.writes).push((characteristic, value));
        Ok(())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> BleResult<NotificationStream> {
        self.peripheral.characteristic(service, characteristic)?;
        let (tx, rx) = unbounded();
        lock(&self.peripheral.inner.notifiers)
            .entry(characteristic)
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    async fn disconnect(&self) -> BleResult<()> {
        if *lock(&self.peripheral.inner.fail_disconnect) {
            return Err(BleError::io("disconnect rejected by stack"));
        }
        lock(&self.peripheral.inner.notifiers).clear();
        lock(&self.adapter).closed(LinkEvent::Disconnected(self.peripheral.inner.id.clone()));
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.peripheral.inner.dropped.subscribe();
        let _ = rx.wait_for(|dropped| *dropped).await;
    }
}
