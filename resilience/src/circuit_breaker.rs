//! Per-dependency circuit breaker.
//!
//! States:
//! - Closed: normal operation
//! - Open: blocking calls until the recovery timeout elapses
//! - HalfOpen: exactly one probe call allowed
//!
//! Closed -> Open when the consecutive failure count reaches the
//! threshold. Open -> HalfOpen once `recovery_timeout` has passed since
//! the last failure; the transition hands out a single probe. HalfOpen ->
//! Closed on success, -> Open on failure.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
    /// Set when entering HalfOpen; consumed by the single allowed probe.
    probe_available: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            failure_count: 0,
            last_failure: None,
            state: BreakerState::Closed,
            probe_available: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a call to the protected dependency should be attempted.
    /// In the Open state this is also where the HalfOpen transition
    /// happens once the recovery timeout has elapsed.
    pub fn can_proceed(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.probe_available = true;
                    info!("breaker[{}]: half-open, allowing probe call", self.name);
                }
                if self.state == BreakerState::HalfOpen && self.probe_available {
                    self.probe_available = false;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                if self.probe_available {
                    self.probe_available = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("breaker[{}]: recovered, closing circuit", self.name);
        }
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.probe_available = false;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        let tripped = self.state == BreakerState::HalfOpen
            || self.failure_count >= self.failure_threshold;
        if tripped {
            if self.state != BreakerState::Open {
                warn!(
                    "breaker[{}]: opened after {} failure(s)",
                    self.name, self.failure_count
                );
            }
            self.state = BreakerState::Open;
            self.probe_available = false;
        }
    }

    pub fn seconds_since_last_failure(&self) -> Option<f64> {
        self.last_failure.map(|t| t.elapsed().as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let mut b = breaker(3, 60_000);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_proceed());
    }

    #[test]
    fn opens_at_threshold_and_blocks() {
        let mut b = breaker(3, 60_000);
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_proceed());
        assert!(!b.can_proceed());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut b = breaker(3, 60_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let mut b = breaker(1, 0);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Zero recovery timeout: next check transitions to half-open.
        assert!(b.can_proceed());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.can_proceed());
    }

    #[test]
    fn half_open_success_closes() {
        let mut b = breaker(1, 0);
        b.record_failure();
        assert!(b.can_proceed());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_proceed());
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = breaker(1, 60_000);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_proceed());
        // Simulate the probe failing after a recovery window.
        b.state = BreakerState::HalfOpen;
        b.probe_available = true;
        assert!(b.can_proceed());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_proceed());
    }
}
