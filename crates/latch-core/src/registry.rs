//! Device registry: doorlocks heard recently while scanning.
//!
//! Records live independently of any connection. A record is refreshed by every
//! advertisement and dropped once it has gone unheard for the TTL. Pruning runs
//! on a fixed interval while scanning and after every advertisement.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::ble::adapter::{Advertisement, BleAdapter};
use crate::ble::protocol::{self, DEFAULT_NAME_FILTER};
use crate::config::BleConfig;

/// Records unheard for this long are dropped.
pub const DEVICE_TTL: Duration = Duration::from_millis(6000);

/// Interval of the periodic prune pass.
pub const PRUNE_INTERVAL: Duration = Duration::from_millis(1000);

/// A discovered doorlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralRecord {
    /// Stable device address.
    pub id: String,
    /// Advertised name.
    pub display_name: String,
    /// Last advertisement time.
    #[serde(skip)]
    pub last_seen_at: Instant,
}

/// Scan filtering and staleness settings.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Case-insensitive name fragment.
    pub name_filter: String,
    /// Record time-to-live.
    pub ttl: Duration,
    /// Prune timer period.
    pub prune_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            name_filter: DEFAULT_NAME_FILTER.to_string(),
            ttl: DEVICE_TTL,
            prune_interval: PRUNE_INTERVAL,
        }
    }
}

impl From<&BleConfig> for DiscoverySettings {
    fn from(config: &BleConfig) -> Self {
        Self {
            name_filter: config.name_filter.clone(),
            ttl: Duration::from_millis(config.device_ttl_ms),
            prune_interval: Duration::from_millis(config.prune_interval_ms),
        }
    }
}

/// The record set plus its published view.
#[derive(Debug)]
pub struct DeviceRegistry {
    records: Vec<PeripheralRecord>,
    ttl: Duration,
    visible: watch::Sender<Vec<PeripheralRecord>>,
}

impl DeviceRegistry {
    /// Empty registry with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        let (visible, _rx) = watch::channel(Vec::new());
        Self {
            records: Vec::new(),
            ttl,
            visible,
        }
    }

    /// Upsert a record for this advertisement, then prune.
    pub fn on_advertisement(&mut self, advertisement: &Advertisement, now: Instant) {
        let display_name = advertisement.display_name().to_string();
        if let Some(record) = self.records.iter_mut().find(|r| r.id == advertisement.id) {
            record.last_seen_at = now;
            record.display_name = display_name;
        } else {
            debug!(id = %advertisement.id, name = %display_name, "Discovered doorlock");
            self.records.push(PeripheralRecord {
                id: advertisement.id.clone(),
                display_name,
                last_seen_at: now,
            });
        }
        self.prune(now);
    }

    /// Drop records whose age has reached the TTL and republish the rest.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.records.retain(|record| {
            let fresh = now.saturating_duration_since(record.last_seen_at) < ttl;
            if !fresh {
                debug!(id = %record.id, "Pruned stale doorlock");
            }
            fresh
        });
        self.visible.send_replace(self.records.clone());
    }

    /// Clear everything and publish an empty list.
    pub fn reset(&mut self) {
        self.records.clear();
        self.visible.send_replace(Vec::new());
    }

    /// Current records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[PeripheralRecord] {
        &self.records
    }

    /// Watch the published list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        self.visible.subscribe()
    }
}

struct ScanTasks {
    scan: Option<JoinHandle<()>>,
    prune: JoinHandle<()>,
}

impl ScanTasks {
    fn abort(self) {
        if let Some(scan) = self.scan {
            scan.abort();
        }
        self.prune.abort();
    }
}

/// Drives scanning and pruning over an adapter.
pub struct Discovery {
    adapter: Option<Arc<dyn BleAdapter>>,
    settings: DiscoverySettings,
    registry: Arc<Mutex<DeviceRegistry>>,
    tasks: Mutex<Option<ScanTasks>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Discovery {
    /// Create a discovery driver. `adapter` is `None` when no radio exists.
    #[must_use]
    pub fn new(adapter: Option<Arc<dyn BleAdapter>>, settings: DiscoverySettings) -> Self {
        let registry = DeviceRegistry::new(settings.ttl);
        Self {
            adapter,
            settings,
            registry: Arc::new(Mutex::new(registry)),
            tasks: Mutex::new(None),
        }
    }

    /// Clear prior results and scan continuously for doorlocks.
    ///
    /// Without an adapter this logs and returns.
    pub async fn start_discovery(&self) {
        let Some(adapter) = self.adapter.clone() else {
            warn!("BLE adapter unavailable, cannot scan");
            return;
        };

        self.halt_tasks();
        self.reset();
        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "Stopping previous scan failed");
        }

        let prune = self.spawn_prune_timer();

        let scan = match adapter.start_scan().await {
            Ok(mut stream) => {
                let registry = Arc::clone(&self.registry);
                let filter = self.settings.name_filter.clone();
                Some(tokio::spawn(async move {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(advertisement) => {
                                if advertisement.id.is_empty()
                                    || !protocol::name_matches(
                                        advertisement.display_name(),
                                        &filter,
                                    )
                                    || advertisement.display_name().is_empty()
                                {
                                    continue;
                                }
                                lock(&registry).on_advertisement(&advertisement, Instant::now());
                            }
                            Err(e) => warn!(error = %e, "Scan error"),
                        }
                    }
                    debug!("Scan stream ended");
                }))
            }
            Err(e) => {
                warn!(error = %e, "Failed to start BLE scan");
                None
            }
        };

        info!(filter = %self.settings.name_filter, "Scanning for doorlocks");
        *lock(&self.tasks) = Some(ScanTasks { scan, prune });
    }

    /// Halt scanning and the prune timer. Records are kept.
    pub async fn stop_discovery(&self) {
        let Some(adapter) = self.adapter.clone() else {
            warn!("BLE adapter unavailable, nothing to stop");
            return;
        };

        if self.halt_tasks() {
            info!("Scan stopped");
        }
        if let Err(e) = adapter.stop_scan().await {
            warn!(error = %e, "Failed to stop BLE scan");
        }
    }

    /// Clear all records and publish an empty list.
    pub fn reset(&self) {
        lock(&self.registry).reset();
    }

    /// Run a prune pass now.
    pub fn prune(&self) {
        lock(&self.registry).prune(Instant::now());
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        lock(&self.tasks).is_some()
    }

    /// Snapshot of the visible devices.
    #[must_use]
    pub fn devices(&self) -> Vec<PeripheralRecord> {
        lock(&self.registry).records().to_vec()
    }

    /// Watch the visible devices.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        lock(&self.registry).subscribe()
    }

    fn spawn_prune_timer(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = self.settings.prune_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                lock(&registry).prune(Instant::now());
            }
        })
    }

    /// Abort running tasks; returns whether any were running.
    fn halt_tasks(&self) -> bool {
        lock(&self.tasks).take().map(ScanTasks::abort).is_some()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.halt_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockAdapter;

    fn advert(id: &str, name: &str) -> Advertisement {
        Advertisement {
            id: id.into(),
            name: Some(name.into()),
            local_name: None,
            rssi: Some(-60),
        }
    }

    fn ids(records: &[PeripheralRecord]) -> Vec<String> {
        records.iter().map(|r| r.id.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_upsert_refreshes_last_seen() {
        let mut registry = DeviceRegistry::new(DEVICE_TTL);
        let t0 = Instant::now();
        registry.on_advertisement(&advert("AA:01", "FrontLock"), t0);
        registry.on_advertisement(&advert("AA:02", "BackLock"), t0);
        registry.on_advertisement(
            &advert("AA:01", "FrontLock"),
            t0 + Duration::from_millis(500),
        );

        assert_eq!(ids(registry.records()), vec!["AA:01", "AA:02"]);
        assert_eq!(
            registry.records()[0].last_seen_at,
            t0 + Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_prune_uses_ttl() {
        let mut registry = DeviceRegistry::new(DEVICE_TTL);
        let rx = registry.subscribe();
        let t0 = Instant::now();
        registry.on_advertisement(&advert("AA:01", "FrontLock"), t0);

        registry.prune(t0 + Duration::from_millis(5999));
        assert_eq!(ids(&rx.borrow()), vec!["AA:01"]);

        registry.prune(t0 + DEVICE_TTL);
        assert!(rx.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_reset_publishes_empty() {
        let mut registry = DeviceRegistry::new(DEVICE_TTL);
        let rx = registry.subscribe();
        registry.on_advertisement(&advert("AA:01", "FrontLock"), Instant::now());
        registry.reset();
        assert!(registry.records().is_empty());
        assert!(rx.borrow().is_empty());
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance_to(start: Instant, millis: u64) {
        tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_device_absent_after_ttl() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());
        let visible = discovery.subscribe();

        let start = Instant::now();
        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        settle().await;
        assert_eq!(ids(&visible.borrow()), vec!["AA:01"]);

        advance_to(start, 5500).await;
        assert_eq!(ids(&visible.borrow()), vec!["AA:01"]);

        advance_to(start, 6500).await;
        assert!(visible.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readvertised_device_survives_until_its_own_ttl() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());
        let visible = discovery.subscribe();

        let start = Instant::now();
        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        settle().await;

        advance_to(start, 500).await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        settle().await;

        advance_to(start, 6500).await;
        assert_eq!(ids(&visible.borrow()), vec!["AA:01"]);

        advance_to(start, 7000).await;
        assert!(visible.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_non_lock_names() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());

        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "Front LOCK"));
        adapter.advertise(advert("AA:02", "Soundbar"));
        adapter.advertise(Advertisement {
            id: "AA:03".into(),
            name: None,
            local_name: None,
            rssi: None,
        });
        settle().await;

        assert_eq!(ids(&discovery.devices()), vec!["AA:01"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_discovery_clears_previous_results() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());

        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        settle().await;
        assert_eq!(discovery.devices().len(), 1);

        discovery.start_discovery().await;
        assert!(discovery.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_drops_advertisements_queued_on_old_scan() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());

        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        discovery.start_discovery().await;
        settle().await;
        assert!(discovery.devices().is_empty());

        adapter.advertise(advert("AA:02", "SmartLock"));
        settle().await;
        assert_eq!(ids(&discovery.devices()), vec!["AA:02"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discovery_keeps_records_and_halts_pruning() {
        let adapter = Arc::new(MockAdapter::new());
        let discovery = Discovery::new(Some(adapter.clone()), DiscoverySettings::default());
        let start = Instant::now();

        discovery.start_discovery().await;
        adapter.advertise(advert("AA:01", "SmartLock"));
        settle().await;

        discovery.stop_discovery().await;
        assert!(!discovery.is_scanning());
        assert!(!adapter.is_scanning());

        advance_to(start, 10_000).await;
        assert_eq!(ids(&discovery.devices()), vec!["AA:01"]);
    }

    #[tokio::test]
    async fn test_discovery_without_adapter_is_noop() {
        let discovery = Discovery::new(None, DiscoverySettings::default());
        discovery.start_discovery().await;
        assert!(!discovery.is_scanning());
        discovery.stop_discovery().await;
        assert!(discovery.devices().is_empty());
    }
}
