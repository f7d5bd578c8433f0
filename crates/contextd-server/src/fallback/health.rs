// crates/contextd-server/src/fallback/health.rs
// Health monitor for the remote backend - drives fallback transitions

use crate::store::VectorStore;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default interval between reachability pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single ping.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// The backend answers pings again but pending writes have not been
    /// replayed yet; reads keep using local until sync promotes to Healthy.
    Recovering,
}

impl HealthState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthState::Healthy,
            1 => HealthState::Unhealthy,
            _ => HealthState::Recovering,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Unhealthy => 1,
            HealthState::Recovering => 2,
        }
    }
}

type TransitionCallback = Arc<dyn Fn(HealthState, HealthState) + Send + Sync>;

/// Tracks remote reachability from two signals: failures observed on live
/// calls, and a periodic lightweight ping.
///
/// Callbacks fire outside the registration lock (the list is copied before
/// firing), so registering from inside a callback cannot deadlock.
pub struct HealthMonitor {
    state: AtomicU8,
    callbacks: Mutex<Vec<TransitionCallback>>,
    ping_interval: Duration,
}

impl HealthMonitor {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            state: AtomicU8::new(HealthState::Healthy.as_u8()),
            callbacks: Mutex::new(Vec::new()),
            ping_interval,
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == HealthState::Healthy
    }

    /// Register a transition callback. Fired as (from, to).
    pub fn on_transition(&self, callback: impl Fn(HealthState, HealthState) + Send + Sync + 'static) {
        let mut callbacks = match self.callbacks.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.push(Arc::new(callback));
    }

    /// A live call against the remote failed with a transport error.
    pub fn record_failure(&self) {
        self.transition(HealthState::Unhealthy);
    }

    /// A ping succeeded. From Unhealthy this means Recovering, not Healthy:
    /// pending writes must replay first.
    pub fn record_ping_success(&self) {
        match self.state() {
            HealthState::Unhealthy => self.transition(HealthState::Recovering),
            HealthState::Healthy | HealthState::Recovering => {}
        }
    }

    /// Sync finished replaying; the remote is authoritative again.
    pub fn mark_healthy(&self) {
        self.transition(HealthState::Healthy);
    }

    fn transition(&self, to: HealthState) {
        let from = HealthState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        if from == to {
            return;
        }
        match to {
            HealthState::Unhealthy => warn!(?from, "remote backend unhealthy, entering fallback"),
            HealthState::Recovering => info!("remote backend reachable again, recovering"),
            HealthState::Healthy => info!("remote backend healthy"),
        }

        // Copy before fire: callbacks run outside the lock.
        let snapshot: Vec<TransitionCallback> = {
            let callbacks = match self.callbacks.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            callbacks.clone()
        };
        for callback in snapshot {
            callback(from, to);
        }
    }

    /// Spawn the ping loop. Returns a shutdown sender; drop or send `true`
    /// to stop the loop.
    pub fn spawn_ping_loop(
        self: &Arc<Self>,
        remote: Arc<dyn VectorStore>,
    ) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let interval = monitor.ping_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ping = tokio::time::timeout(PING_TIMEOUT, remote.health_check()).await;
                        match ping {
                            Ok(Ok(())) => monitor.record_ping_success(),
                            Ok(Err(_)) | Err(_) => {
                                // Only demote when we thought the remote was up;
                                // Recovering falls back to Unhealthy too.
                                if monitor.state() != HealthState::Unhealthy {
                                    monitor.record_failure();
                                }
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_initial_state_is_healthy() {
        let monitor = HealthMonitor::default();
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_failure_then_ping_then_sync_promotion() {
        let monitor = HealthMonitor::default();

        monitor.record_failure();
        assert_eq!(monitor.state(), HealthState::Unhealthy);

        monitor.record_ping_success();
        assert_eq!(monitor.state(), HealthState::Recovering);
        assert!(!monitor.is_healthy());

        monitor.mark_healthy();
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_ping_success_while_healthy_is_noop() {
        let monitor = HealthMonitor::default();
        monitor.record_ping_success();
        assert_eq!(monitor.state(), HealthState::Healthy);
    }

    #[test]
    fn test_callbacks_fire_on_transitions_only() {
        let monitor = HealthMonitor::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        monitor.on_transition(move |_, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.record_failure();
        monitor.record_failure(); // same state, no transition
        monitor.record_ping_success();
        monitor.mark_healthy();

        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callback_can_register_another_callback() {
        let monitor = Arc::new(HealthMonitor::default());
        let inner = monitor.clone();
        // Registering from inside a callback must not deadlock.
        monitor.on_transition(move |_, _| {
            inner.on_transition(|_, _| {});
        });
        monitor.record_failure();
        assert_eq!(monitor.state(), HealthState::Unhealthy);
    }
}
