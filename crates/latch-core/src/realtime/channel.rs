//! Realtime status channel.
//!
//! One socket, one subscribed device. On open the channel subscribes and seeds
//! the lock state from HTTP once. Errors and closes share a single reconnect
//! path with exponential backoff. A generation counter, bumped whenever a
//! socket is opened or torn down, makes callbacks from old sockets and timers
//! inert.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::backoff::{Backoff, ReconnectState};
use super::message::{self, ClientMessage, ServerMessage};
use super::transport::{SocketConnection, SocketConnector};
use super::{RealtimeError, RealtimeResult};
use crate::backend::BackendError;
use crate::ble::protocol::LockCommand;
use crate::config::LatchConfig;
use crate::lock_state::{LockState, LockStateCell, UpdateSource};

/// HTTP side of the lock service as used by the channel and context.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// `GET status/{device_id}`.
    async fn fetch_status(&self, device_id: &str) -> Result<LockState, BackendError>;

    /// `POST send-command/{device_id}/{command}`.
    async fn send_command(&self, device_id: &str, command: LockCommand) -> Result<(), BackendError>;
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    /// No device, no socket.
    #[default]
    Idle,
    /// Socket opening.
    Connecting,
    /// Socket open and subscribed.
    Open,
    /// Socket lost, about to schedule a retry.
    Closing,
    /// Waiting for the retry timer.
    Retrying,
}

/// Where and how the channel connects.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Backend base URL (`http` or `https`).
    pub base_url: String,
    /// Path appended to the socket origin.
    pub socket_path: String,
    /// Reconnect delays.
    pub backoff: Backoff,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from(&LatchConfig::default())
    }
}

impl From<&LatchConfig> for ChannelSettings {
    fn from(config: &LatchConfig) -> Self {
        Self {
            base_url: config.backend.base_url.clone(),
            socket_path: config.realtime.socket_path.clone(),
            backoff: Backoff::from(&config.realtime),
        }
    }
}

struct SocketTask {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelState {
    device_id: Option<String>,
    reconnect: ReconnectState,
    retry: Option<JoinHandle<()>>,
    socket: Option<SocketTask>,
    generation: u64,
}

struct Inner {
    settings: ChannelSettings,
    connector: Arc<dyn SocketConnector>,
    backend: Arc<dyn LockBackend>,
    lock_state: LockStateCell,
    phase: watch::Sender<ChannelPhase>,
    state: Mutex<ChannelState>,
}

/// Realtime lock-status channel.
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("phase", &self.phase())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl RealtimeChannel {
    /// Create an idle channel.
    #[must_use]
    pub fn new(
        settings: ChannelSettings,
        connector: Arc<dyn SocketConnector>,
        backend: Arc<dyn LockBackend>,
        lock_state: LockStateCell,
    ) -> Self {
        let (phase, _) = watch::channel(ChannelPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                backend,
                lock_state,
                phase,
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    /// Open the socket for `device_id` and subscribe to its status.
    ///
    /// Does nothing for an empty id or when the same device is already
    /// connecting or open. Any other socket is torn down first.
    pub fn connect(&self, device_id: &str) {
        if device_id.is_empty() {
            debug!("No device id, realtime channel stays idle");
            return;
        }

        let mut state = self.inner.lock();
        let same_device = state.device_id.as_deref() == Some(device_id);
        let live = matches!(
            self.phase(),
            ChannelPhase::Connecting | ChannelPhase::Open
        );
        if same_device && state.socket.is_some() && live {
            debug!(device_id, "Realtime channel already active");
            return;
        }

        let previous = self.inner.teardown(&mut state);
        if !same_device {
            state.reconnect.reset();
        }
        state.device_id = Some(device_id.to_string());
        self.inner.open_socket(&mut state, previous);
    }

    /// Cancel any retry and close the socket. The channel becomes idle.
    pub fn disconnect_all(&self) {
        let mut state = self.inner.lock();
        self.inner.teardown(&mut state);
        state.device_id = None;
        state.reconnect.reset();
        self.inner.set_phase(ChannelPhase::Idle);
        info!("Realtime channel closed");
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ChannelPhase {
        *self.inner.phase.borrow()
    }

    /// Watch the phase.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<ChannelPhase> {
        self.inner.phase.subscribe()
    }

    /// `true` only while the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase() == ChannelPhase::Open
    }

    /// The subscribed device.
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.inner.lock().device_id.clone()
    }

    /// Retries scheduled since the last successful open.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().reconnect.attempt
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        self.inner.teardown(&mut state);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ChannelPhase) {
        self.phase.send_replace(phase);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Cancel the retry timer and close the socket. Leaves the device id.
    ///
    /// Returns the closing socket's task; it finishes once the close is sent.
    fn teardown(&self, state: &mut ChannelState) -> Option<JoinHandle<()>> {
        state.generation += 1;
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        let mut socket = state.socket.take()?;
        self.set_phase(ChannelPhase::Closing);
        if let Some(shutdown) = socket.shutdown.take() {
            let _ = shutdown.send(());
        }
        Some(socket.task)
    }

    /// Spawn the socket task for the current device. A `previous` socket task
    /// is awaited first so the old socket is closed before the new one opens.
    fn open_socket(self: &Arc<Self>, state: &mut ChannelState, previous: Option<JoinHandle<()>>) {
        let Some(device_id) = state.device_id.clone() else {
            self.set_phase(ChannelPhase::Idle);
            return;
        };
        let url = match message::socket_url(&self.settings.base_url, &self.settings.socket_path) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot derive realtime socket URL");
                self.set_phase(ChannelPhase::Idle);
                return;
            }
        };

        state.generation += 1;
        let generation = state.generation;
        self.set_phase(ChannelPhase::Connecting);
        info!(device_id = %device_id, url = %url, generation, "Opening realtime socket");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).run_socket(
            generation,
            device_id,
            url,
            previous,
            shutdown_rx,
        ));
        state.socket = Some(SocketTask {
            shutdown: Some(shutdown_tx),
            task,
        });
    }

    async fn run_socket(
        self: Arc<Self>,
        generation: u64,
        device_id: String,
        url: Url,
        previous: Option<JoinHandle<()>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        if let Some(previous) = previous {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = previous => {}
            }
        }

        let connected = tokio::select! {
            biased;
            _ = &mut shutdown => return,
            connected = self.connector.connect(&url) => connected,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Realtime socket failed to open");
                self.on_socket_closed(generation);
                return;
            }
        };

        if !self.on_open(generation) {
            conn.close().await;
            return;
        }

        let subscribed = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!(device_id = %device_id, generation, "Socket replaced before subscribing");
                conn.close().await;
                return;
            }
            subscribed = self.subscribe(conn.as_mut(), &device_id) => subscribed,
        };
        if let Err(e) = subscribed {
            warn!(device_id = %device_id, error = %e, "Subscribe failed");
            conn.close().await;
            self.on_socket_closed(generation);
            return;
        }
        self.spawn_status_seed(generation, device_id.clone());

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    conn.close().await;
                    return;
                }
                frame = conn.next_text() => match frame {
                    Some(Ok(text)) => self.on_message(generation, &device_id, &text),
                    Some(Err(e)) => {
                        warn!(device_id = %device_id, error = %e, "Realtime socket error");
                        conn.close().await;
                        break;
                    }
                    None => {
                        info!(device_id = %device_id, "Realtime socket closed by server");
                        break;
                    }
                },
            }
        }
        self.on_socket_closed(generation);
    }

    async fn subscribe(
        &self,
        conn: &mut dyn SocketConnection,
        device_id: &str,
    ) -> RealtimeResult<()> {
        let frame = ClientMessage::Subscribe {
            device_id: device_id.to_string(),
        }
        .to_json()
        .map_err(|e| RealtimeError::Send(e.to_string()))?;
        conn.send_text(frame).await?;
        debug!(device_id, "Subscribed to device status");
        Ok(())
    }

    fn on_open(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(generation, "Stale socket opened, closing it");
            return false;
        }
        state.reconnect.reset();
        self.set_phase(ChannelPhase::Open);
        info!(generation, "Realtime socket open");
        true
    }

    fn spawn_status_seed(self: &Arc<Self>, generation: u64, device_id: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.backend.fetch_status(&device_id).await {
                Ok(status) if inner.is_current(generation) => {
                    inner.lock_state.apply(status, UpdateSource::Http);
                }
                Ok(_) => debug!(device_id = %device_id, "Discarding status for a replaced socket"),
                Err(e) => warn!(device_id = %device_id, error = %e, "Status fetch failed"),
            }
        });
    }

    fn on_message(&self, generation: u64, device_id: &str, raw: &str) {
        let message = match ServerMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed realtime message");
                return;
            }
        };
        match message.status_for(device_id) {
            Some(status) if self.is_current(generation) => {
                self.lock_state.apply(status, UpdateSource::Realtime);
            }
            Some(_) => {}
            None => debug!(?message, "Ignoring realtime message"),
        }
    }

    fn on_socket_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.socket = None;
        self.set_phase(ChannelPhase::Closing);
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ChannelState) {
        if let Some(previous) = state.retry.take() {
            previous.abort();
        }
        if state.device_id.is_none() {
            self.set_phase(ChannelPhase::Idle);
            return;
        }

        let delay = state.reconnect.schedule(&self.settings.backoff);
        let generation = state.generation;
        self.set_phase(ChannelPhase::Retrying);
        info!(
            attempt = state.reconnect.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling realtime reconnect"
        );

        let inner = Arc::clone(self);
        state.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.on_retry(generation);
        }));
    }

    fn on_retry(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.retry = None;
        self.open_socket(&mut state, None);
    }
}
