//! Time-windowed gate for incoming remote snapshots.
//!
//! A snapshot that arrives right after a local write (or a sync) usually
//! reflects a state older than what is on screen. The gate holds such
//! snapshots back until things have been quiet for long enough.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::GateConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateBlock {
    LocalWriteApplying,
    ErrorPending(String),
    RecentSync { remaining: Duration },
    RecentLocalWrite { remaining: Duration },
}

impl fmt::Display for GateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateBlock::LocalWriteApplying => write!(f, "a local write is in flight"),
            GateBlock::ErrorPending(e) => write!(f, "last sync failed: {e}"),
            GateBlock::RecentSync { remaining } => {
                write!(f, "synced recently ({}ms left)", remaining.as_millis())
            }
            GateBlock::RecentLocalWrite { remaining } => {
                write!(f, "written locally recently ({}ms left)", remaining.as_millis())
            }
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    writes_in_flight: usize,
    last_local_write_finished: Option<Instant>,
    last_sync_completed: Option<Instant>,
    error_pending: Option<String>,
}

#[derive(Debug)]
pub struct SyncGate {
    config: GateConfig,
    state: Mutex<GateState>,
}

/// Marks a local write as applying until dropped.
pub struct LocalWrite<'a> {
    gate: &'a SyncGate,
}

impl Drop for LocalWrite<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.writes_in_flight = state.writes_in_flight.saturating_sub(1);
        state.last_local_write_finished = Some(Instant::now());
    }
}

fn remaining(since: Option<Instant>, min: Duration, now: Instant) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(since?);
    (elapsed < min).then(|| min - elapsed)
}

impl SyncGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn begin_local_write(&self) -> LocalWrite<'_> {
        self.lock().writes_in_flight += 1;
        LocalWrite { gate: self }
    }

    pub fn local_write_applying(&self) -> bool {
        self.lock().writes_in_flight > 0
    }

    pub fn record_sync_completed(&self, at: Instant) {
        let mut state = self.lock();
        state.last_sync_completed = Some(at);
        state.error_pending = None;
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.lock().error_pending = Some(error.into());
    }

    pub fn clear_error(&self) {
        self.lock().error_pending = None;
    }

    pub fn error_pending(&self) -> Option<String> {
        self.lock().error_pending.clone()
    }

    /// First reason a snapshot must wait, if any. Events that never
    /// happened do not block.
    pub fn check(&self, now: Instant) -> Option<GateBlock> {
        let state = self.lock();
        if state.writes_in_flight > 0 {
            return Some(GateBlock::LocalWriteApplying);
        }
        if let Some(e) = &state.error_pending {
            return Some(GateBlock::ErrorPending(e.clone()));
        }
        if let Some(left) = remaining(state.last_sync_completed, self.config.min_since_sync(), now) {
            return Some(GateBlock::RecentSync { remaining: left });
        }
        if let Some(left) = remaining(
            state.last_local_write_finished,
            self.config.min_since_local_write(),
            now,
        ) {
            return Some(GateBlock::RecentLocalWrite { remaining: left });
        }
        None
    }

    pub fn should_apply_remote(&self, now: Instant) -> bool {
        self.check(now).is_none()
    }
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_gate_allows() {
        let gate = SyncGate::default();
        assert!(gate.should_apply_remote(Instant::now()));
    }

    #[test]
    fn test_recent_sync_blocks_for_window() {
        let gate = SyncGate::default();
        let t0 = Instant::now();
        gate.record_sync_completed(t0);

        assert_eq!(
            gate.check(t0 + Duration::from_secs(10)),
            Some(GateBlock::RecentSync {
                remaining: Duration::from_secs(5)
            })
        );
        assert!(gate.should_apply_remote(t0 + Duration::from_secs(15)));
    }

    #[test]
    fn test_in_flight_write_blocks_then_window_applies() {
        let gate = SyncGate::default();

        let write = gate.begin_local_write();
        assert_eq!(gate.check(Instant::now()), Some(GateBlock::LocalWriteApplying));
        drop(write);

        let finished = Instant::now();
        assert!(matches!(
            gate.check(finished + Duration::from_secs(19)),
            Some(GateBlock::RecentLocalWrite { .. })
        ));
        assert!(gate.should_apply_remote(finished + Duration::from_secs(21)));
    }

    #[test]
    fn test_error_blocks_until_sync_succeeds() {
        let gate = SyncGate::default();
        gate.set_error("unavailable");
        assert_eq!(
            gate.check(Instant::now()),
            Some(GateBlock::ErrorPending("unavailable".into()))
        );

        let t0 = Instant::now();
        gate.record_sync_completed(t0);
        assert!(gate.error_pending().is_none());
        assert!(gate.should_apply_remote(t0 + Duration::from_secs(16)));
    }

    #[test]
    fn test_overlapping_writes() {
        let gate = SyncGate::default();
        let a = gate.begin_local_write();
        let b = gate.begin_local_write();
        drop(a);
        assert!(gate.local_write_applying());
        drop(b);
        assert!(!gate.local_write_applying());
    }
}
