//! Circuit breaker for token refresh.
//!
//! One breaker per `(provider, tenant_id)`. State is in-memory only and
//! resets on process restart. All transitions happen under one mutex so
//! concurrent refresh attempts cannot lose failure counts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::clock::Clock;

/// Consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Cool-down before an OPEN breaker lets one trial call through.
pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// Whether a refresh attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Breaker is CLOSED, or HALF_OPEN and this caller holds the one trial slot.
    Allow,
    /// Breaker is OPEN (cool-down running) or a HALF_OPEN trial is already out.
    Reject,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_settings(clock, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN_SECS)
    }

    pub fn with_settings(clock: Arc<dyn Clock>, threshold: u32, cooldown_secs: i64) -> Self {
        Self {
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold,
            cooldown: Duration::seconds(cooldown_secs),
            clock,
        }
    }

    /// Gate a refresh attempt. An OPEN breaker whose cool-down has elapsed
    /// moves to HALF_OPEN and admits exactly this caller as the trial.
    pub fn check(&self) -> Decision {
        let mut state = self.state.lock().unwrap();
        match state.status {
            CircuitStatus::Closed => Decision::Allow,
            CircuitStatus::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| self.clock.now() - at >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    state.status = CircuitStatus::HalfOpen;
                    info!("circuit breaker half-open, admitting one trial refresh");
                    Decision::Allow
                } else {
                    Decision::Reject
                }
            }
            // A trial refresh is already in flight.
            CircuitStatus::HalfOpen => Decision::Reject,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Closed {
            info!("circuit breaker closed after successful refresh");
        }
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Give back an admitted HALF_OPEN trial that never produced an outcome
    /// (the refresh bailed before reaching the network). The breaker returns
    /// to OPEN with its original `opened_at`, so the already-elapsed
    /// cool-down lets the next caller claim the trial slot immediately
    /// instead of the slot staying leased forever.
    pub fn release_trial(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == CircuitStatus::HalfOpen {
            state.status = CircuitStatus::Open;
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.status {
            CircuitStatus::HalfOpen => {
                // Failed trial: back to OPEN with a fresh cool-down.
                state.status = CircuitStatus::Open;
                state.opened_at = Some(self.clock.now());
                warn!("circuit breaker trial refresh failed, reopening");
            }
            CircuitStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.threshold {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(self.clock.now());
                    warn!(
                        failures = state.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitStatus::Open => {}
        }
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().unwrap().status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (CircuitBreaker::new(clock.clone()), clock)
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let (b, _) = breaker();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.check(), Decision::Allow);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let (b, _) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            b.record_failure();
            assert_eq!(b.status(), CircuitStatus::Closed);
        }
        b.record_failure();
        assert_eq!(b.status(), CircuitStatus::Open);
        assert_eq!(b.check(), Decision::Reject);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (b, _) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            b.record_failure();
        }
        b.record_success();
        // Counter reset: another near-threshold run stays closed.
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            b.record_failure();
        }
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_admits_one_trial() {
        let (b, clock) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure();
        }
        assert_eq!(b.check(), Decision::Reject);

        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS + 1));
        // Exactly one trial is admitted.
        assert_eq!(b.check(), Decision::Allow);
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert_eq!(b.check(), Decision::Reject);
    }

    #[test]
    fn test_trial_success_closes() {
        let (b, clock) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure();
        }
        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS + 1));
        assert_eq!(b.check(), Decision::Allow);

        b.record_success();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.check(), Decision::Allow);
    }

    #[test]
    fn test_released_trial_readmits_next_caller() {
        let (b, clock) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure();
        }
        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS + 1));
        assert_eq!(b.check(), Decision::Allow);
        assert_eq!(b.status(), CircuitStatus::HalfOpen);

        // The trial never ran; the slot must not stay leased.
        b.release_trial();
        assert_eq!(b.status(), CircuitStatus::Open);
        // Cool-down already elapsed, so the next caller claims the trial.
        assert_eq!(b.check(), Decision::Allow);
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
    }

    #[test]
    fn test_release_is_a_noop_outside_half_open() {
        let (b, _) = breaker();
        b.release_trial();
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let (b, clock) = breaker();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure();
        }
        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS + 1));
        assert_eq!(b.check(), Decision::Allow);

        b.record_failure();
        assert_eq!(b.status(), CircuitStatus::Open);
        // Cool-down restarted from the failed trial, not the original open.
        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS / 2));
        assert_eq!(b.check(), Decision::Reject);
        clock.advance(Duration::seconds(DEFAULT_COOLDOWN_SECS));
        assert_eq!(b.check(), Decision::Allow);
    }
}
