//! Composition root.
//!
//! [`LockContext`] owns one of everything: the BLE session manager, the
//! realtime channel, the backend client, the session store and the merged
//! lock state. Lock and unlock go over BLE when a doorlock is connected and
//! over HTTP otherwise.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, DeviceSettings, SettingKey, SignUpRequest};
use crate::ble::adapter::BleAdapter;
use crate::ble::permissions::{PermissionPrompt, Platform};
use crate::ble::protocol::{LedColor, LockCommand};
use crate::ble::session::{BleSessionManager, ConnectionHandle, Subscription};
use crate::config::LatchConfig;
use crate::error::{LatchError, Result};
use crate::lock_state::{LockState, LockStateCell, LockTransitions, LockUpdate, UpdateSource};
use crate::realtime::channel::{ChannelPhase, ChannelSettings, LockBackend, RealtimeChannel};
use crate::realtime::transport::SocketConnector;
use crate::registry::{DiscoverySettings, PeripheralRecord};
use crate::session::{Session, SessionStore};

/// How a lock/unlock request was dispatched.
#[derive(Debug)]
pub enum CommandDispatch {
    /// Written to the connected doorlock.
    Ble,
    /// Sent to the backend in the background.
    Remote(JoinHandle<()>),
    /// Nowhere to send it: no doorlock connected and no device selected.
    Dropped,
}

impl CommandDispatch {
    /// Wait for a background send to finish.
    pub async fn settled(self) {
        if let Self::Remote(handle) = self {
            if let Err(e) = handle.await {
                debug!(error = %e, "Remote command task ended abnormally");
            }
        }
    }
}

/// Everything the doorlock client needs, wired together.
pub struct LockContext {
    ble: BleSessionManager,
    realtime: RealtimeChannel,
    backend: Arc<BackendClient>,
    commands: Arc<dyn LockBackend>,
    store: Arc<dyn SessionStore>,
    lock_state: LockStateCell,
    default_device_id: Option<String>,
    device_id: watch::Sender<Option<String>>,
    lock_state_poll: Option<Duration>,
    ble_feeds: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("ble", &self.ble)
            .field("realtime", &self.realtime)
            .field("device_id", &*self.device_id.borrow())
            .field("lock_state", &self.lock_state.state())
            .finish_non_exhaustive()
    }
}

impl LockContext {
    /// Build a context from configuration.
    ///
    /// `adapter` is `None` on hosts without Bluetooth; BLE operations then
    /// degrade to logged no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend client cannot be created.
    pub fn new(
        config: &LatchConfig,
        adapter: Option<Arc<dyn BleAdapter>>,
        connector: Arc<dyn SocketConnector>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let backend = Arc::new(BackendClient::from_config(&config.backend)?);
        let commands: Arc<dyn LockBackend> = backend.clone();
        Ok(Self::assemble(config, adapter, connector, backend, commands, store))
    }

    pub(crate) fn assemble(
        config: &LatchConfig,
        adapter: Option<Arc<dyn BleAdapter>>,
        connector: Arc<dyn SocketConnector>,
        backend: Arc<BackendClient>,
        commands: Arc<dyn LockBackend>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let lock_state = LockStateCell::new();
        let realtime = RealtimeChannel::new(
            ChannelSettings::from(config),
            connector,
            Arc::clone(&commands),
            lock_state.clone(),
        );
        let (device_id, _) = watch::channel(None);
        Self {
            ble: BleSessionManager::new(adapter, DiscoverySettings::from(&config.ble)),
            realtime,
            backend,
            commands,
            store,
            lock_state,
            default_device_id: config.device.default_device_id.clone(),
            device_id,
            lock_state_poll: (config.ble.lock_state_poll_ms > 0)
                .then(|| Duration::from_millis(config.ble.lock_state_poll_ms)),
            ble_feeds: Mutex::new(Vec::new()),
        }
    }

    /// Use a platform-specific permission prompt for BLE.
    #[must_use]
    pub fn with_permissions(mut self, platform: Platform, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.ble = self.ble.with_permissions(platform, prompt);
        self
    }

    fn feeds(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.ble_feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lock state
    // =========================================================================

    /// Merged "is locked" value across BLE, realtime and HTTP.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_state.is_locked()
    }

    /// Merged lock state.
    #[must_use]
    pub fn lock_state(&self) -> LockState {
        self.lock_state.state()
    }

    /// Watch every applied lock-state write.
    #[must_use]
    pub fn subscribe_lock_updates(&self) -> watch::Receiver<LockUpdate> {
        self.lock_state.subscribe()
    }

    /// Locked/unlocked flips after the current value.
    #[must_use]
    pub fn lock_transitions(&self) -> LockTransitions {
        self.lock_state.transitions()
    }

    /// Fetch the selected device's status over HTTP and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::NoDeviceSelected`] or the backend failure.
    pub async fn refresh_status(&self) -> Result<LockState> {
        let device_id = self.device_id().ok_or(LatchError::NoDeviceSelected)?;
        let state = self.backend.fetch_status(&device_id).await?;
        self.lock_state.apply(state, UpdateSource::Http);
        Ok(state)
    }

    /// Whether the realtime channel is open.
    #[must_use]
    pub fn is_device_connected(&self) -> bool {
        self.realtime.is_open()
    }

    /// Watch the realtime channel phase.
    #[must_use]
    pub fn subscribe_channel_phase(&self) -> watch::Receiver<ChannelPhase> {
        self.realtime.subscribe_phase()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Lock the door.
    pub async fn lock(&self) -> CommandDispatch {
        self.dispatch(LockCommand::Lock).await
    }

    /// Unlock the door.
    pub async fn unlock(&self) -> CommandDispatch {
        self.dispatch(LockCommand::Unlock).await
    }

    async fn dispatch(&self, command: LockCommand) -> CommandDispatch {
        if self.ble.connected_device().is_some() {
            self.ble.send_command(command.as_str(), None).await;
            return CommandDispatch::Ble;
        }

        let Some(device_id) = self.device_id() else {
            warn!(%command, "No doorlock connected and no device selected, command dropped");
            return CommandDispatch::Dropped;
        };

        let backend = Arc::clone(&self.commands);
        CommandDispatch::Remote(tokio::spawn(async move {
            if let Err(e) = backend.send_command(&device_id, command).await {
                warn!(device_id = %device_id, %command, error = %e, "Remote command failed");
            }
        }))
    }

    /// Write a raw command to the connected doorlock.
    pub async fn send_command(&self, command: &str) {
        self.ble.send_command(command, None).await;
    }

    // =========================================================================
    // BLE
    // =========================================================================

    /// Request the runtime permissions BLE needs.
    pub async fn request_permissions(&self) -> bool {
        self.ble.request_permissions().await
    }

    /// Start scanning for doorlocks.
    pub async fn start_discovery(&self) {
        self.ble.start_discovery().await;
    }

    /// Stop scanning.
    pub async fn stop_discovery(&self) {
        self.ble.stop_discovery().await;
    }

    /// Doorlocks heard recently.
    #[must_use]
    pub fn all_devices(&self) -> Vec<PeripheralRecord> {
        self.ble.devices()
    }

    /// Watch the doorlocks heard recently.
    #[must_use]
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        self.ble.subscribe_devices()
    }

    /// The connected doorlock.
    #[must_use]
    pub fn connected_device(&self) -> Option<ConnectionHandle> {
        self.ble.connected_device()
    }

    /// Connect to a doorlock and route its lock-state notifications into the
    /// merged state.
    ///
    /// # Errors
    ///
    /// Returns the BLE failure; the manager is left disconnected.
    pub async fn connect_to_device(&self, peripheral_id: &str) -> Result<ConnectionHandle> {
        self.feeds().clear();
        let handle = self.ble.connect(peripheral_id).await?;

        let mut feeds = Vec::new();
        feeds.extend(self.ble.subscribe_lock_state(self.ble_writer()).await);
        if let Some(period) = self.lock_state_poll {
            feeds.extend(self.ble.poll_lock_state(period, self.ble_writer()).await);
        }
        *self.feeds() = feeds;

        Ok(handle)
    }

    fn ble_writer(&self) -> impl FnMut(String) + Send + 'static {
        let cell = self.lock_state.clone();
        move |status| match LockState::from_status(&status) {
            Some(state) => {
                cell.apply(state, UpdateSource::Ble);
            }
            None => debug!(status = %status, "Ignoring lock-state value"),
        }
    }

    /// Disconnect a doorlock, defaulting to the connected one.
    pub async fn disconnect_from_device(&self, peripheral_id: Option<&str>) {
        let targets_active = match (peripheral_id, self.ble.connected_device()) {
            (None, _) => true,
            (Some(id), Some(active)) => active.peripheral_id == id,
            (Some(_), None) => false,
        };
        if targets_active {
            self.feeds().clear();
        }
        self.ble.disconnect(peripheral_id).await;
    }

    /// Deliver lock-state notifications to `callback`.
    pub async fn subscribe_lock_state<F>(&self, callback: F) -> Option<Subscription>
    where
        F: FnMut(String) + Send + 'static,
    {
        self.ble.subscribe_lock_state(callback).await
    }

    /// One-shot read of the lock-state characteristic.
    pub async fn read_lock_state(&self) -> Option<String> {
        self.ble.read_lock_state().await
    }

    /// One-shot read of the MAC address characteristic.
    pub async fn read_mac_address(&self) -> Option<String> {
        self.ble.read_mac_address().await
    }

    /// Watch the status LED color.
    #[must_use]
    pub fn subscribe_color(&self) -> watch::Receiver<LedColor> {
        self.ble.subscribe_color_notifications()
    }

    /// Send Wi-Fi credentials to the connected doorlock.
    pub async fn provision_wifi(&self, ssid: &str, password: &str) {
        self.ble.provision_wifi(ssid, password).await;
    }

    /// Point the connected doorlock at a backend.
    pub async fn provision_backend(&self, base_url: &str) {
        self.ble.provision_backend(base_url).await;
    }

    // =========================================================================
    // Session and device selection
    // =========================================================================

    /// The device whose status is followed.
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.device_id.borrow().clone()
    }

    /// Watch the selected device.
    #[must_use]
    pub fn subscribe_device_id(&self) -> watch::Receiver<Option<String>> {
        self.device_id.subscribe()
    }

    /// Select the device to follow. The realtime channel is torn down before
    /// the new one is opened; `None` leaves it closed.
    pub fn set_device_id(&self, device_id: Option<String>) {
        let device_id = device_id.filter(|id| !id.is_empty());
        if *self.device_id.borrow() == device_id {
            if let Some(id) = &device_id {
                self.realtime.connect(id);
            }
            return;
        }

        self.realtime.disconnect_all();
        info!(device_id = ?device_id, "Selected device");
        self.device_id.send_replace(device_id.clone());
        if let Some(id) = device_id {
            self.realtime.connect(&id);
        }
    }

    /// Restore the stored session and follow its device, or the configured
    /// default.
    pub fn restore_session(&self) -> Option<Session> {
        let session = self.store.get_session();
        if let Some(session) = &session {
            self.backend.set_token(session.token.clone());
        }
        let device_id = session
            .as_ref()
            .and_then(Session::device_id)
            .map(str::to_string)
            .or_else(|| self.default_device_id.clone());
        debug!(device_id = ?device_id, restored = session.is_some(), "Restoring session");
        self.set_device_id(device_id);
        session
    }

    /// Sign in, persist the session and follow the user's device.
    ///
    /// # Errors
    ///
    /// Returns the backend rejection or a persistence failure.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.backend.sign_in(email, password).await?;
        self.adopt_session(&session)?;
        Ok(session)
    }

    /// Create an account, persist the session and follow the user's device.
    ///
    /// # Errors
    ///
    /// Returns the backend rejection or a persistence failure.
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<Session> {
        let session = self.backend.sign_up(request).await?;
        self.adopt_session(&session)?;
        Ok(session)
    }

    fn adopt_session(&self, session: &Session) -> Result<()> {
        self.store.set_session(session)?;
        if let Some(device_id) = session.device_id() {
            self.set_device_id(Some(device_id.to_string()));
        }
        Ok(())
    }

    /// Forget the session and close the realtime channel.
    pub fn sign_out(&self) {
        if let Err(e) = self.store.clear_session() {
            warn!(error = %e, "Failed to clear stored session");
        }
        self.backend.set_token(None);
        self.set_device_id(None);
        info!("Signed out");
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Settings of the selected device.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::NoDeviceSelected`] or the backend failure.
    pub async fn fetch_settings(&self) -> Result<DeviceSettings> {
        let device_id = self.device_id().ok_or(LatchError::NoDeviceSelected)?;
        Ok(self.backend.fetch_settings(&device_id).await?)
    }

    /// Change one setting of the selected device.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::NoDeviceSelected`] or the backend failure.
    pub async fn update_setting(&self, key: SettingKey, value: bool) -> Result<Option<DeviceSettings>> {
        let device_id = self.device_id().ok_or(LatchError::NoDeviceSelected)?;
        Ok(self.backend.update_setting(&device_id, key, value).await?)
    }

    /// Close the realtime channel and the BLE link.
    pub async fn shutdown(&self) {
        self.realtime.disconnect_all();
        self.feeds().clear();
        self.ble.stop_discovery().await;
        self.ble.disconnect(None).await;
    }
}
