//! The single merged lock state.
//!
//! Three producers write here: BLE notifications, realtime pushes and HTTP
//! status fetches. Writes are applied in arrival order and the last one wins;
//! nothing reconciles them. Each applied write gets a local sequence number so
//! tests and logs can tell which write landed last.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Lock status of the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockState {
    /// Bolt thrown.
    Locked,
    /// Bolt retracted.
    Unlocked,
    /// Nothing heard yet.
    #[default]
    Unknown,
}

impl LockState {
    /// Parse a status string carried by a BLE notification or realtime push.
    ///
    /// Only `"LOCKED"` and `"UNLOCKED"` are recognised.
    #[must_use]
    pub fn from_status(status: &str) -> Option<Self> {
        match status {
            "LOCKED" => Some(Self::Locked),
            "UNLOCKED" => Some(Self::Unlocked),
            _ => None,
        }
    }

    /// Map an HTTP status field: exactly `"LOCKED"` is locked, anything else unlocked.
    #[must_use]
    pub fn from_http_status(status: &str) -> Self {
        if status == "LOCKED" {
            Self::Locked
        } else {
            Self::Unlocked
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "LOCKED",
            Self::Unlocked => "UNLOCKED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `true` only for [`LockState::Locked`].
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(self, Self::Locked)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Lock-state characteristic notification or read.
    Ble,
    /// Realtime socket push.
    Realtime,
    /// HTTP status fetch.
    Http,
}

/// One applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockUpdate {
    /// The state after this write.
    pub state: LockState,
    /// Producer, `None` for the initial value.
    pub source: Option<UpdateSource>,
    /// Local apply counter; 0 for the initial value.
    pub seq: u64,
    /// Wall-clock time the write was applied.
    pub applied_at: DateTime<Utc>,
}

impl LockUpdate {
    fn initial() -> Self {
        Self {
            state: LockState::Unknown,
            source: None,
            seq: 0,
            applied_at: Utc::now(),
        }
    }
}

/// Shared, cloneable handle on the merged lock state.
#[derive(Debug, Clone)]
pub struct LockStateCell {
    tx: Arc<watch::Sender<LockUpdate>>,
}

impl Default for LockStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateCell {
    /// Create a cell holding [`LockState::Unknown`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LockUpdate::initial());
        Self { tx: Arc::new(tx) }
    }

    /// Apply a write. Last write wins.
    ///
    /// The sequence number is assigned under the watch's write lock, so the
    /// published value always carries the highest seq handed out.
    pub fn apply(&self, state: LockState, source: UpdateSource) -> LockUpdate {
        let mut update = LockUpdate {
            state,
            source: Some(source),
            seq: 0,
            applied_at: Utc::now(),
        };
        self.tx.send_modify(|current| {
            update.seq = current.seq + 1;
            *current = update.clone();
        });
        debug!(state = %state, ?source, seq = update.seq, "Lock state applied");
        update
    }

    /// The most recent write.
    #[must_use]
    pub fn current(&self) -> LockUpdate {
        self.tx.borrow().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.tx.borrow().state
    }

    /// Merged "is locked" boolean.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state().is_locked()
    }

    /// Watch every write.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LockUpdate> {
        self.tx.subscribe()
    }

    /// Stream of locked/unlocked flips, starting from the current value.
    #[must_use]
    pub fn transitions(&self) -> LockTransitions {
        let rx = self.tx.subscribe();
        let last = rx.borrow().state.is_locked();
        LockTransitions { rx, last }
    }
}

/// Yields the new "is locked" value each time it flips.
#[derive(Debug)]
pub struct LockTransitions {
    rx: watch::Receiver<LockUpdate>,
    last: bool,
}

impl LockTransitions {
    /// Wait for the next flip. `None` once the cell is gone.
    pub async fn next(&mut self) -> Option<bool> {
        loop {
            self.rx.changed().await.ok()?;
            let locked = self.rx.borrow_and_update().state.is_locked();
            if locked != self.last {
                self.last = locked;
                return Some(locked);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(LockState::from_status("LOCKED"), Some(LockState::Locked));
        assert_eq!(LockState::from_status("UNLOCKED"), Some(LockState::Unlocked));
        assert_eq!(LockState::from_status("locked"), None);
        assert_eq!(LockState::from_status("JAMMED"), None);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(LockState::from_http_status("LOCKED"), LockState::Locked);
        assert_eq!(LockState::from_http_status("UNLOCKED"), LockState::Unlocked);
        assert_eq!(LockState::from_http_status("JAMMED"), LockState::Unlocked);
    }

    #[test]
    fn test_last_write_wins_across_sources() {
        let cell = LockStateCell::new();
        assert_eq!(cell.state(), LockState::Unknown);

        cell.apply(LockState::Locked, UpdateSource::Ble);
        cell.apply(LockState::Unlocked, UpdateSource::Realtime);
        let last = cell.apply(LockState::Locked, UpdateSource::Http);

        assert!(cell.is_locked());
        assert_eq!(cell.current(), last);
        assert_eq!(last.seq, 3);
        assert_eq!(last.source, Some(UpdateSource::Http));
    }

    #[test]
    fn test_interleavings_converge_on_last_applied() {
        let sequences = [
            [
                (LockState::Locked, UpdateSource::Ble),
                (LockState::Unlocked, UpdateSource::Realtime),
            ],
            [
                (LockState::Unlocked, UpdateSource::Realtime),
                (LockState::Locked, UpdateSource::Ble),
            ],
        ];
        for sequence in sequences {
            let cell = LockStateCell::new();
            for (state, source) in sequence {
                cell.apply(state, source);
            }
            assert_eq!(cell.state(), sequence[1].0);
        }
    }

    #[tokio::test]
    async fn test_transitions_skip_repeats() {
        let cell = LockStateCell::new();
        let mut transitions = cell.transitions();

        cell.apply(LockState::Unlocked, UpdateSource::Http);
        cell.apply(LockState::Locked, UpdateSource::Realtime);
        assert_eq!(transitions.next().await, Some(true));

        cell.apply(LockState::Locked, UpdateSource::Ble);
        cell.apply(LockState::Unlocked, UpdateSource::Ble);
        assert_eq!(transitions.next().await, Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_applies_publish_highest_seq() {
        const TASKS: u64 = 8;
        const WRITES: u64 = 500;

        let cell = LockStateCell::new();
        let mut handles = Vec::new();
        for task in 0..TASKS {
            let cell = cell.clone();
            handles.push(tokio::spawn(async move {
                let (state, source) = if task % 2 == 0 {
                    (LockState::Locked, UpdateSource::Ble)
                } else {
                    (LockState::Unlocked, UpdateSource::Realtime)
                };
                for _ in 0..WRITES {
                    cell.apply(state, source);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cell.current().seq, TASKS * WRITES);
    }

    #[test]
    fn test_transitions_wait_for_a_flip() {
        let cell = LockStateCell::new();
        let mut transitions = cell.transitions();
        let mut next = tokio_test::task::spawn(transitions.next());
        tokio_test::assert_pending!(next.poll());

        // Unknown -> Unlocked is not a flip.
        cell.apply(LockState::Unlocked, UpdateSource::Http);
        tokio_test::assert_pending!(next.poll());

        cell.apply(LockState::Locked, UpdateSource::Ble);
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(true));
    }
}
