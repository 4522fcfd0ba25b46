//! BLE session manager.
//!
//! Owns the one active doorlock connection. Opening a new connection always
//! closes the previous one first, and every feed spawned for a connection is
//! aborted when it goes away. Commands and reads never fail toward the caller;
//! failures are logged and the operation becomes a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adapter::{BleAdapter, GattLink};
use super::permissions::{self, AlwaysGranted, PermissionPrompt, Platform};
use super::protocol::{
    BackendEndpoint, LedColor, WifiCredentials, COLOR_CHAR_UUID, COMMAND_CHAR_UUID,
    LOCK_STATE_CHAR_UUID, MAC_ADDRESS_CHAR_UUID, SERVICE_UUID,
};
use super::{BleError, BleResult};
use crate::codec;
use crate::registry::{Discovery, DiscoverySettings, PeripheralRecord};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No link.
    #[default]
    Disconnected,
    /// Opening and discovering.
    Connecting,
    /// Link ready.
    Connected,
    /// Closing.
    Disconnecting,
}

/// The lock service's characteristic UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CharacteristicIds {
    /// Command (write).
    pub command: Uuid,
    /// Lock state (read, notify).
    pub lock_state: Uuid,
    /// MAC address (read).
    pub mac_address: Uuid,
    /// LED color (notify).
    pub color: Uuid,
}

impl Default for CharacteristicIds {
    fn default() -> Self {
        Self {
            command: COMMAND_CHAR_UUID,
            lock_state: LOCK_STATE_CHAR_UUID,
            mac_address: MAC_ADDRESS_CHAR_UUID,
            color: COLOR_CHAR_UUID,
        }
    }
}

impl CharacteristicIds {
    fn all(&self) -> [Uuid; 4] {
        [self.command, self.lock_state, self.mac_address, self.color]
    }
}

/// Description of the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    /// Connected peripheral.
    pub peripheral_id: String,
    /// Lock service UUID.
    pub service_id: Uuid,
    /// Characteristics discovered on the service.
    pub characteristic_ids: CharacteristicIds,
}

/// Disposer for a lock-state feed. Dropping it also stops the feed.
#[derive(Debug)]
pub struct Subscription {
    abort: AbortHandle,
}

impl Subscription {
    /// Stop delivering notifications.
    pub fn unsubscribe(self) {
        self.abort.abort();
    }

    /// Whether the feed is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.abort.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    link: Arc<dyn GattLink>,
    generation: u64,
    color_feed: Option<JoinHandle<()>>,
    watcher: JoinHandle<()>,
    feeds: Vec<AbortHandle>,
}

impl ActiveConnection {
    fn abort_tasks(&mut self) {
        if let Some(feed) = self.color_feed.take() {
            feed.abort();
        }
        for feed in self.feeds.drain(..) {
            feed.abort();
        }
    }
}

struct Shared {
    active: Mutex<Option<ActiveConnection>>,
    phase: watch::Sender<ConnectionPhase>,
    connected: watch::Sender<Option<ConnectionHandle>>,
    color: watch::Sender<LedColor>,
    generation: AtomicU64,
}

impl Shared {
    fn set_phase(&self, phase: ConnectionPhase) {
        self.phase.send_replace(phase);
    }

    fn mark_disconnected(&self) {
        self.connected.send_replace(None);
        self.set_phase(ConnectionPhase::Disconnected);
    }

    async fn on_link_lost(&self, generation: u64) {
        let mut active = self.active.lock().await;
        let is_current = active
            .as_ref()
            .is_some_and(|conn| conn.generation == generation);
        if !is_current {
            return;
        }
        if let Some(mut conn) = active.take() {
            warn!(id = %conn.handle.peripheral_id, "Doorlock dropped the connection");
            conn.abort_tasks();
        }
        self.mark_disconnected();
    }
}

/// Manages the single BLE connection to a doorlock.
pub struct BleSessionManager {
    adapter: Option<Arc<dyn BleAdapter>>,
    discovery: Discovery,
    platform: Platform,
    prompt: Arc<dyn PermissionPrompt>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BleSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSessionManager")
            .field("adapter", &self.adapter.is_some())
            .field("platform", &self.platform)
            .field("phase", &*self.shared.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl BleSessionManager {
    /// Create a manager. `adapter` is `None` when the host has no radio.
    #[must_use]
    pub fn new(adapter: Option<Arc<dyn BleAdapter>>, settings: DiscoverySettings) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        let (connected, _) = watch::channel(None);
        let (color, _) = watch::channel(LedColor::default());
        Self {
            discovery: Discovery::new(adapter.clone(), settings),
            adapter,
            platform: Platform::Desktop,
            prompt: Arc::new(AlwaysGranted),
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                phase,
                connected,
                color,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Use a platform-specific permission prompt.
    #[must_use]
    pub fn with_permissions(mut self, platform: Platform, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.platform = platform;
        self.prompt = prompt;
        self
    }

    // =========================================================================
    // Permissions and discovery
    // =========================================================================

    /// Request the runtime permissions BLE needs on this platform.
    ///
    /// Callers must not scan or connect when this returns `false`.
    pub async fn request_permissions(&self) -> bool {
        permissions::request_permissions(self.platform, self.prompt.as_ref()).await
    }

    /// See [`Discovery::start_discovery`].
    pub async fn start_discovery(&self) {
        self.discovery.start_discovery().await;
    }

    /// See [`Discovery::stop_discovery`].
    pub async fn stop_discovery(&self) {
        self.discovery.stop_discovery().await;
    }

    /// Clear discovered devices.
    pub fn reset_discovery(&self) {
        self.discovery.reset();
    }

    /// Currently visible doorlocks.
    #[must_use]
    pub fn devices(&self) -> Vec<PeripheralRecord> {
        self.discovery.devices()
    }

    /// Watch the visible doorlocks.
    #[must_use]
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        self.discovery.subscribe()
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.discovery.is_scanning()
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.borrow()
    }

    /// Watch the phase.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase.subscribe()
    }

    /// The live connection, if any.
    #[must_use]
    pub fn connected_device(&self) -> Option<ConnectionHandle> {
        self.shared.connected.borrow().clone()
    }

    /// Watch the live connection.
    #[must_use]
    pub fn subscribe_connected(&self) -> watch::Receiver<Option<ConnectionHandle>> {
        self.shared.connected.subscribe()
    }

    /// Connect to a doorlock.
    ///
    /// Any existing connection is closed first. On success discovery is
    /// stopped and the color feed started. Failures are logged, leave the
    /// manager disconnected and are not retried.
    ///
    /// # Errors
    ///
    /// Returns the adapter, discovery or lookup failure.
    pub async fn connect(&self, peripheral_id: &str) -> BleResult<ConnectionHandle> {
        let Some(adapter) = self.adapter.clone() else {
            warn!(id = %peripheral_id, "BLE adapter unavailable, cannot connect");
            return Err(BleError::AdapterUnavailable);
        };

        let mut active = self.shared.active.lock().await;
        if let Some(previous) = active.take() {
            info!(
                previous = %previous.handle.peripheral_id,
                next = %peripheral_id,
                "Closing existing connection before connecting"
            );
            self.shared.set_phase(ConnectionPhase::Disconnecting);
            teardown(previous).await;
            self.shared.mark_disconnected();
        }

        self.shared.set_phase(ConnectionPhase::Connecting);
        info!(id = %peripheral_id, "Connecting to doorlock");

        let (link, handle) = match open_link(adapter.as_ref(), peripheral_id).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(id = %peripheral_id, error = %e, "Failed to connect to doorlock");
                self.shared.mark_disconnected();
                return Err(e);
            }
        };

        self.discovery.stop_discovery().await;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let color_feed = spawn_color_feed(&link, self.shared.color.clone()).await;
        let watcher = {
            let shared = Arc::clone(&self.shared);
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.closed().await;
                shared.on_link_lost(generation).await;
            })
        };

        *active = Some(ActiveConnection {
            handle: handle.clone(),
            link,
            generation,
            color_feed,
            watcher,
            feeds: Vec::new(),
        });
        self.shared.connected.send_replace(Some(handle.clone()));
        self.shared.set_phase(ConnectionPhase::Connected);
        info!(id = %peripheral_id, "Connected to doorlock");

        Ok(handle)
    }

    /// Disconnect a doorlock, defaulting to the connected one.
    ///
    /// Local state for the active connection is reset even when the stack
    /// reports a teardown failure. A target that is not the active connection
    /// is cancelled at the adapter and the active link is left alone.
    pub async fn disconnect(&self, peripheral_id: Option<&str>) {
        let mut active = self.shared.active.lock().await;
        let active_id = active.as_ref().map(|conn| conn.handle.peripheral_id.clone());

        let Some(target) = peripheral_id.map(str::to_string).or_else(|| active_id.clone()) else {
            debug!("No doorlock to disconnect");
            return;
        };

        if active_id.as_deref() == Some(target.as_str()) {
            if let Some(conn) = active.take() {
                self.shared.set_phase(ConnectionPhase::Disconnecting);
                teardown(conn).await;
            }
            self.shared.mark_disconnected();
            info!(id = %target, "Disconnected from doorlock");
            return;
        }

        match &self.adapter {
            Some(adapter) => match adapter.cancel_connection(&target).await {
                Ok(()) => info!(id = %target, "Cancelled doorlock connection"),
                Err(e) => warn!(id = %target, error = %e, "Failed to cancel doorlock connection"),
            },
            None => warn!(id = %target, "BLE adapter unavailable, cannot disconnect"),
        }
    }

    // =========================================================================
    // Characteristics
    // =========================================================================

    /// Deliver every decoded lock-state notification to `callback`.
    ///
    /// Notification errors are logged and the feed keeps running. Returns
    /// `None` when nothing is connected or the subscription fails.
    pub async fn subscribe_lock_state<F>(&self, mut callback: F) -> Option<Subscription>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut active = self.shared.active.lock().await;
        let Some(conn) = active.as_mut() else {
            warn!("No doorlock connected, cannot subscribe to lock state");
            return None;
        };

        let mut stream = match conn.link.subscribe(SERVICE_UUID, LOCK_STATE_CHAR_UUID).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(id = %conn.handle.peripheral_id, error = %e, "Lock state subscription failed");
                return None;
            }
        };

        let id = conn.handle.peripheral_id.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => {
                        let text = codec::decode(Some(&payload));
                        debug!(id = %id, status = %text, "Lock state notification");
                        callback(text);
                    }
                    Err(e) => warn!(id = %id, error = %e, "Lock state notification error"),
                }
            }
        });
        let abort = task.abort_handle();
        conn.feeds.push(abort.clone());
        Some(Subscription { abort })
    }

    /// Read the lock-state characteristic every `period` and hand each
    /// non-empty value to `callback`.
    ///
    /// The first read happens one period after the call. The poll belongs to
    /// the current connection and stops with it. Returns `None` when nothing
    /// is connected.
    pub async fn poll_lock_state<F>(&self, period: Duration, mut callback: F) -> Option<Subscription>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut active = self.shared.active.lock().await;
        let Some(conn) = active.as_mut() else {
            warn!("No doorlock connected, cannot poll lock state");
            return None;
        };

        let link = Arc::clone(&conn.link);
        let id = conn.handle.peripheral_id.clone();
        let task = tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match link.read(SERVICE_UUID, LOCK_STATE_CHAR_UUID).await {
                    Ok(payload) => {
                        let text = codec::decode(Some(&payload));
                        if !text.is_empty() {
                            callback(text);
                        }
                    }
                    Err(e) => debug!(id = %id, error = %e, "Lock state poll failed"),
                }
            }
        });
        let abort = task.abort_handle();
        conn.feeds.push(abort.clone());
        Some(Subscription { abort })
    }

    /// Read the lock-state characteristic once.
    pub async fn read_lock_state(&self) -> Option<String> {
        self.read_text(LOCK_STATE_CHAR_UUID).await
    }

    /// Read the MAC address characteristic once.
    pub async fn read_mac_address(&self) -> Option<String> {
        self.read_text(MAC_ADDRESS_CHAR_UUID).await
    }

    async fn read_text(&self, characteristic: Uuid) -> Option<String> {
        let Some(link) = self.current_link(None).await else {
            debug!(%characteristic, "No doorlock connected, skipping read");
            return None;
        };
        match link.read(SERVICE_UUID, characteristic).await {
            Ok(payload) => {
                let text = codec::decode(Some(&payload));
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                warn!(id = %link.peripheral_id(), %characteristic, error = %e, "Characteristic read failed");
                None
            }
        }
    }

    /// Write a command to the doorlock, acknowledged by the peripheral.
    ///
    /// `target` defaults to the connected doorlock. Never fails; every outcome
    /// is logged.
    pub async fn send_command(&self, command: &str, target: Option<&str>) {
        let Some(link) = self.current_link(target).await else {
            warn!(command, target = ?target, "No doorlock connected, command not sent");
            return;
        };
        match link
            .write_with_response(SERVICE_UUID, COMMAND_CHAR_UUID, codec::encode(command))
            .await
        {
            Ok(()) => info!(id = %link.peripheral_id(), command, "Command sent"),
            Err(e) => error!(id = %link.peripheral_id(), command, error = %e, "Command failed"),
        }
    }

    /// Watch the status LED color.
    #[must_use]
    pub fn subscribe_color_notifications(&self) -> watch::Receiver<LedColor> {
        self.shared.color.subscribe()
    }

    /// Send Wi-Fi credentials to the connected doorlock.
    pub async fn provision_wifi(&self, ssid: &str, password: &str) {
        let credentials = WifiCredentials {
            ssid: ssid.to_string(),
            password: password.to_string(),
        };
        self.send_json(&credentials).await;
    }

    /// Tell the connected doorlock which backend to report to.
    pub async fn provision_backend(&self, base_url: &str) {
        let endpoint = BackendEndpoint {
            backend_base_url: base_url.to_string(),
        };
        self.send_json(&endpoint).await;
    }

    async fn send_json<T: Serialize + Sync>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.send_command(&json, None).await,
            Err(e) => error!(error = %e, "Failed to serialize provisioning payload"),
        }
    }

    async fn current_link(&self, target: Option<&str>) -> Option<Arc<dyn GattLink>> {
        let active = self.shared.active.lock().await;
        let conn = active.as_ref()?;
        match target {
            Some(id) if id != conn.handle.peripheral_id => None,
            _ => Some(Arc::clone(&conn.link)),
        }
    }
}

async fn open_link(
    adapter: &dyn BleAdapter,
    peripheral_id: &str,
) -> BleResult<(Arc<dyn GattLink>, ConnectionHandle)> {
    let link = adapter.connect(peripheral_id).await?;

    let ids = CharacteristicIds::default();
    let discovered = match link.discover(SERVICE_UUID).await {
        Ok(chars) => chars,
        Err(e) => {
            close_quietly(link.as_ref()).await;
            return Err(e);
        }
    };
    if let Some(missing) = ids.all().into_iter().find(|uuid| !discovered.contains(uuid)) {
        close_quietly(link.as_ref()).await;
        return Err(BleError::CharacteristicNotFound { uuid: missing });
    }

    let handle = ConnectionHandle {
        peripheral_id: peripheral_id.to_string(),
        service_id: SERVICE_UUID,
        characteristic_ids: ids,
    };
    Ok((link, handle))
}

async fn spawn_color_feed(
    link: &Arc<dyn GattLink>,
    color: watch::Sender<LedColor>,
) -> Option<JoinHandle<()>> {
    let mut stream = match link.subscribe(SERVICE_UUID, COLOR_CHAR_UUID).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(id = %link.peripheral_id(), error = %e, "Color subscription failed");
            return None;
        }
    };
    let id = link.peripheral_id().to_string();
    Some(tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(payload) => {
                    let code = codec::decode(Some(&payload));
                    let led = LedColor::from_code(&code);
                    debug!(id = %id, code = %code, ?led, "Color notification");
                    color.send_replace(led);
                }
                Err(e) => warn!(id = %id, error = %e, "Color notification error"),
            }
        }
    }))
}

async fn teardown(mut conn: ActiveConnection) {
    conn.abort_tasks();
    conn.watcher.abort();
    if let Err(e) = conn.link.disconnect().await {
        warn!(id = %conn.handle.peripheral_id, error = %e, "Disconnect failed, clearing local state anyway");
    }
}

async fn close_quietly(link: &dyn GattLink) {
    if let Err(e) = link.disconnect().await {
        debug!(id = %link.peripheral_id(), error = %e, "Closing half-open link failed");
    }
}
