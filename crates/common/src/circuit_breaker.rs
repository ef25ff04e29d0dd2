//! Circuit breaker isolating failing certificate providers
//!
//! Each configured upstream CA gets its own breaker. When a provider keeps
//! failing, the breaker opens and the provider selector leaves it out of
//! fallback chains until the open timeout elapses and a trial request is allowed.
//!
//! All operations are lock-free and complete in constant time.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::types::{CircuitBreakerConfig, CircuitBreakerState};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Circuit breaker with the usual three states:
/// - **Closed**: provider attempts pass through
/// - **Open**: failure threshold reached, provider is skipped
/// - **Half-Open**: open timeout elapsed, a limited number of trial requests allowed
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    /// Reference point for `changed_at_ns`
    epoch: Instant,
    /// Nanoseconds since `epoch` at the last state change
    changed_at_ns: AtomicU64,
    half_open_trials: AtomicU64,
    name: String,
}

impl CircuitBreaker {
    /// Create a named breaker; the name shows up in every log line
    pub fn new(config: CircuitBreakerConfig, name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(
            name = %name,
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.timeout_seconds,
            "Creating circuit breaker"
        );

        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            epoch: Instant::now(),
            changed_at_ns: AtomicU64::new(0),
            half_open_trials: AtomicU64::new(0),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an attempt against the protected provider may proceed.
    ///
    /// Moves Open -> HalfOpen once the open timeout has elapsed.
    pub fn allows_attempt(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => {
                let elapsed_ns = self.now_ns().saturating_sub(self.changed_at_ns.load(Ordering::Acquire));
                let timeout_ns = self.config.timeout_seconds.saturating_mul(1_000_000_000);
                if elapsed_ns >= timeout_ns {
                    self.transition(STATE_OPEN, STATE_HALF_OPEN);
                    self.take_trial()
                } else {
                    trace!(name = %self.name, "Circuit open, attempt blocked");
                    false
                }
            }
            STATE_HALF_OPEN => self.take_trial(),
            _ => true,
        }
    }

    fn take_trial(&self) -> bool {
        let taken = self.half_open_trials.fetch_add(1, Ordering::Relaxed);
        let allowed = taken < u64::from(self.config.half_open_max_requests);
        trace!(name = %self.name, trial = taken + 1, allowed, "Half-open trial request");
        allowed
    }

    /// Record a successful provider call
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN
            && successes >= u64::from(self.config.success_threshold)
        {
            self.transition(STATE_HALF_OPEN, STATE_CLOSED);
        }
    }

    /// Record a failed provider call
    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED if failures >= u64::from(self.config.failure_threshold) => {
                self.transition(STATE_CLOSED, STATE_OPEN);
            }
            STATE_HALF_OPEN => {
                self.transition(STATE_HALF_OPEN, STATE_OPEN);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitBreakerState::Open,
            STATE_HALF_OPEN => CircuitBreakerState::HalfOpen,
            _ => CircuitBreakerState::Closed,
        }
    }

    /// Open and still inside the open timeout.
    ///
    /// Read-only: does not move the breaker to half-open or use up a trial request.
    pub fn is_rejecting(&self) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }
        let elapsed_ns = self.now_ns().saturating_sub(self.changed_at_ns.load(Ordering::Acquire));
        elapsed_ns < self.config.timeout_seconds.saturating_mul(1_000_000_000)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.changed_at_ns.store(self.now_ns(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.half_open_trials.store(0, Ordering::Relaxed);
        info!(name = %self.name, "Circuit breaker reset");
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn transition(&self, from: u8, to: u8) {
        if self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.changed_at_ns.store(self.now_ns(), Ordering::Release);
        match to {
            STATE_OPEN => {
                warn!(
                    name = %self.name,
                    consecutive_failures = self.consecutive_failures(),
                    "Circuit breaker opened"
                );
            }
            STATE_HALF_OPEN => {
                self.half_open_trials.store(0, Ordering::Relaxed);
                info!(name = %self.name, "Circuit breaker half-open");
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.half_open_trials.store(0, Ordering::Relaxed);
                info!(name = %self.name, "Circuit breaker closed");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_seconds: 60,
            half_open_max_requests: 2,
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new(test_config(), "commercial");
        assert!(cb.allows_attempt());
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(test_config(), "commercial");
        for _ in 0..3 {
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(!cb.allows_attempt());
    }

    #[test]
    fn test_is_rejecting_has_no_side_effects() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout_seconds: 0,
            half_open_max_requests: 1,
        };
        let cb = CircuitBreaker::new(config, "cloud");
        cb.record_failure();

        // Timeout already elapsed: not rejecting, but still open
        for _ in 0..3 {
            assert!(!cb.is_rejecting());
        }
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        // The single half-open trial is still available
        assert!(cb.allows_attempt());

        let cb = CircuitBreaker::new(test_config(), "commercial");
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.is_rejecting());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(test_config(), "cloud");
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_then_close() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout_seconds: 0,
            half_open_max_requests: 1,
        };
        let cb = CircuitBreaker::new(config, "free-acme");

        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cb.allows_attempt());
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        // Only one trial while half-open
        assert!(!cb.allows_attempt());

        cb.record_success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout_seconds: 0,
            half_open_max_requests: 1,
        };
        let cb = CircuitBreaker::new(config, "cloud");

        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cb.allows_attempt());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new(test_config(), "commercial");
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();

        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cb = Arc::new(CircuitBreaker::new(test_config(), "commercial"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..500 {
                        cb.allows_attempt();
                        cb.record_failure();
                        cb.record_success();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(matches!(
            cb.state(),
            CircuitBreakerState::Closed | CircuitBreakerState::Open | CircuitBreakerState::HalfOpen
        ));
    }

    proptest::proptest! {
        /// Opens exactly when a run of `failure_threshold` failures occurred
        #[test]
        fn prop_opens_on_consecutive_failures(outcomes in proptest::collection::vec(proptest::bool::ANY, 0..32)) {
            let cb = CircuitBreaker::new(test_config(), "commercial");
            let mut run = 0;
            let mut opened = false;
            for failed in outcomes {
                if failed {
                    cb.record_failure();
                    run += 1;
                    opened |= run >= 3;
                } else {
                    cb.record_success();
                    run = 0;
                }
            }
            proptest::prop_assert_eq!(cb.state() == CircuitBreakerState::Open, opened);
        }
    }
}
