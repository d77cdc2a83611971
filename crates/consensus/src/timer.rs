//! Pacemaker timers.
//!
//! This module provides:
//! - [`TimeoutConfig`] - base/delta/max round timeouts with governance fallback
//! - [`TimerEvent`] - the event delivered when a round timer fires
//! - [`TimerService`] - schedules one active timer per (height, level)
//!
//! Timeouts grow linearly with the number of levels since the last block
//! QC, so that a run of failed leaders eventually gives honest nodes enough
//! time to reach each other once the network stabilizes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::types::ConsensusState;

/// Default base round timeout
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default per-level backoff
pub const DEFAULT_TIMEOUT_DELTA: Duration = Duration::from_millis(500);
/// Default cap on any round timeout
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// Round timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Timeout of a level directly following a block QC
    pub base: Duration,
    /// Extra time per level without a block QC
    pub delta: Duration,
    /// Upper bound
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_TIMEOUT,
            delta: DEFAULT_TIMEOUT_DELTA,
            max: DEFAULT_MAX_TIMEOUT,
        }
    }
}

impl TimeoutConfig {
    /// Overlay governance-provided millisecond values on `defaults`.
    ///
    /// Zero or out-of-range values keep the default, so a bad governance
    /// entry can never produce a zero timeout.
    pub fn from_governance(base_ms: u64, delta_ms: u64, defaults: &TimeoutConfig) -> Self {
        let max_ms = defaults.max.as_millis() as u64;
        let base = if base_ms == 0 || base_ms > max_ms {
            if base_ms != 0 {
                warn!(base_ms, max_ms, "governance base timeout out of range, using default");
            }
            defaults.base
        } else {
            Duration::from_millis(base_ms)
        };
        let delta = if delta_ms == 0 || delta_ms > max_ms {
            if delta_ms != 0 {
                warn!(delta_ms, max_ms, "governance timeout delta out of range, using default");
            }
            defaults.delta
        } else {
            Duration::from_millis(delta_ms)
        };
        Self {
            base,
            delta,
            max: defaults.max,
        }
    }

    /// Timeout for `level` given the level of the highest block QC.
    ///
    /// timeout = base + delta * (level - qc_level - 1), capped at `max`
    pub fn timeout_for(&self, level: u64, qc_level: u64) -> Duration {
        let steps = level.saturating_sub(qc_level.saturating_add(1));
        let steps = u32::try_from(steps).unwrap_or(u32::MAX);
        self.base
            .saturating_add(self.delta.saturating_mul(steps))
            .min(self.max)
    }
}

/// A round timer. Delivered back to the SMR when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Height the timer was armed for
    pub height: u64,
    /// Level the timer was armed for
    pub level: u64,
    /// Epoch the timer was armed in
    pub epoch_id: u64,
    /// State the SMR was in when arming
    pub state: ConsensusState,
    /// How long to wait
    pub duration: Duration,
}

struct ActiveTimer {
    height: u64,
    level: u64,
    handle: JoinHandle<()>,
}

/// Single-slot timer service.
///
/// Arming a new event replaces the previous one, which keeps at most one
/// timer alive per (height, level). Cancellation never blocks and is safe to
/// repeat.
pub struct TimerService {
    tx: mpsc::Sender<TimerEvent>,
    active: Mutex<Option<ActiveTimer>>,
    running: AtomicBool,
}

impl TimerService {
    /// Create a timer service and the channel fired events arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                active: Mutex::new(None),
                running: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Allow events to be armed.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Cancel the active timer and refuse new ones.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(active) = self.active.lock().take() {
            active.handle.abort();
        }
    }

    /// Whether [`start`](Self::start) was called and [`stop`](Self::stop) was not.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm `event`, replacing any active timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_event(&self, event: TimerEvent) {
        if !self.is_running() {
            trace!(height = event.height, level = event.level, "timer service stopped, ignoring event");
            return;
        }

        debug!(
            height = event.height,
            level = event.level,
            epoch = event.epoch_id,
            state = %event.state,
            duration_ms = event.duration.as_millis() as u64,
            "Scheduling round timer"
        );

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(event.duration).await;
            trace!(height = event.height, level = event.level, "Round timer fired");
            let _ = tx.send(event).await;
        });

        let previous = self.active.lock().replace(ActiveTimer {
            height: event.height,
            level: event.level,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// (height, level) of the active timer.
    pub fn active(&self) -> Option<(u64, u64)> {
        self.active.lock().as_ref().map(|t| (t.height, t.level))
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.handle.abort();
        }
    }
}
