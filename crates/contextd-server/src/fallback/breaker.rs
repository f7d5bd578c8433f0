// crates/contextd-server/src/fallback/breaker.rs
// Circuit breaker for WAL replay - stops hammering a remote that keeps failing

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Consecutive batch failures before the circuit trips.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long a tripped circuit stays open before allowing a single probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Circuit state for the replay path.
#[derive(Debug, Clone)]
enum State {
    /// Normal operation - counting consecutive failures.
    Closed { consecutive_failures: u32 },
    /// Tripped - replay attempts are rejected until cooldown expires.
    Open { tripped_at: Instant },
    /// Cooldown expired - exactly one probe replay may run.
    HalfOpen,
}

impl Default for State {
    fn default() -> Self {
        Self::Closed {
            consecutive_failures: 0,
        }
    }
}

/// Thread-safe circuit breaker guarding sync replay against the remote.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<State>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            threshold,
            cooldown,
        }
    }

    /// Check whether a replay attempt may proceed.
    ///
    /// Returns `true` if the circuit is Closed or transitions to HalfOpen
    /// (allowing a single probe). Returns `false` while Open within the
    /// cooldown, and while a half-open probe is already in flight.
    pub fn allow_attempt(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true; // If the mutex is poisoned, allow the attempt
        };
        match *state {
            State::Closed { .. } => true,
            State::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    info!("sync circuit half-open, allowing probe replay");
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => false,
        }
    }

    /// Record a successful replay batch - resets the circuit to Closed.
    pub fn record_success(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let was_half_open = matches!(*state, State::HalfOpen);
        *state = State::Closed {
            consecutive_failures: 0,
        };
        if was_half_open {
            info!("sync circuit recovered (half-open probe succeeded)");
        }
    }

    /// Record a failed replay batch - may trip the circuit.
    pub fn record_failure(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.threshold {
                    warn!(
                        failures = *consecutive_failures,
                        "sync circuit tripped - replay paused for {}s",
                        self.cooldown.as_secs()
                    );
                    *state = State::Open {
                        tripped_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen => {
                warn!("half-open probe failed - sync circuit re-tripped");
                *state = State::Open {
                    tripped_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_breaker_allows_attempts() {
        let cb = CircuitBreaker::default();
        assert!(cb.allow_attempt());
    }

    #[test]
    fn test_below_threshold_does_not_trip() {
        let cb = CircuitBreaker::default();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            cb.record_failure();
        }
        assert!(cb.allow_attempt());
    }

    #[test]
    fn test_threshold_failures_trip_circuit() {
        let cb = CircuitBreaker::default();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            cb.record_failure();
        }
        assert!(!cb.allow_attempt());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::default();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            cb.record_failure();
        }
        cb.record_success();
        cb.record_failure();
        assert!(cb.allow_attempt());
    }

    #[test]
    fn test_open_circuit_half_opens_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure();
        assert!(!cb.allow_attempt());

        // Rewind the trip time past the cooldown.
        {
            let mut state = cb.state.lock().unwrap();
            *state = State::Open {
                tripped_at: Instant::now() - Duration::from_secs(61),
            };
        }
        assert!(cb.allow_attempt());
        // Only a single probe while half-open.
        assert!(!cb.allow_attempt());
    }

    #[test]
    fn test_half_open_failure_retrips() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        {
            let mut state = cb.state.lock().unwrap();
            *state = State::HalfOpen;
        }
        cb.record_failure();
        assert!(!cb.allow_attempt());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        {
            let mut state = cb.state.lock().unwrap();
            *state = State::HalfOpen;
        }
        cb.record_success();
        assert!(cb.allow_attempt());
    }
}
