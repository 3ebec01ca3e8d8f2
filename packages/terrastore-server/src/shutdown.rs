//! Pause/resume and shutdown coordination (§4.10, §5 "watchdog").
//!
//! Adapts the corpus's `ArcSwap`-based health-state controller: here the
//! states are the ones a topology transition walks through, and
//! `wait_for_drain` doubles as the watchdog that bounds a pause.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state of the local [`crate::coordinator::Coordinator`] (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet joined the local cluster.
    Starting,
    /// Serving requests normally.
    Ready,
    /// A topology transition is in progress; new commands are parked (§5).
    Draining,
    /// `shutdown` has completed; `send` now fails with a defined error.
    Stopped,
}

/// Coordinates pause/resume during topology transitions and the final
/// shutdown sequence. `shutdown` is idempotent (§8 "idempotent shutdown").
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self { signal, in_flight: Arc::new(AtomicU64::new(0)), state: Arc::new(ArcSwap::from_pointee(LifecycleState::Starting)) }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// A receiver that fires once [`ShutdownController::trigger_shutdown`] is called.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Begins draining: new commands should stop being accepted by callers
    /// that observe [`LifecycleState::Draining`].
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        let _ = self.signal.send(true);
    }

    /// An RAII guard tracking one in-flight command; decrements on drop even
    /// if the holder panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { in_flight: Arc::clone(&self.in_flight) }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight commands to drain, up to `timeout` -- the
    /// watchdog ceiling a topology transition must not exceed (§5). Returns
    /// `true` and transitions to [`LifecycleState::Stopped`] on success,
    /// `false` (state unchanged) on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting_state() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), LifecycleState::Starting);
    }

    #[test]
    fn trigger_shutdown_moves_to_draining() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger_shutdown();
        assert_eq!(controller.state(), LifecycleState::Draining);
    }

    #[tokio::test]
    async fn wait_for_drain_succeeds_with_no_in_flight_work() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        assert!(controller.wait_for_drain(Duration::from_millis(100)).await);
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_with_pending_work() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.state(), LifecycleState::Draining);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.trigger_shutdown();
        assert_eq!(controller.state(), LifecycleState::Draining);
    }
}
