//! Per-channel circuit breaker
//!
//! Tracks consecutive failures for one logical channel, opens to shed load
//! and half-opens to probe recovery. Mutated only by the TransportChannel on
//! attempt completion/failure; environment-teardown failures are excluded
//! from the accounting by the caller simply not recording them.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CircuitBreakerConfig;
use crate::types::{TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Breaker State
// ----------------------------------------------------------------------------

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Normal operation, attempts pass through
    Closed,
    /// Shedding load; attempts fail fast without I/O
    Open,
    /// Probing recovery with a limited number of attempts
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

// ----------------------------------------------------------------------------
// Circuit Breaker
// ----------------------------------------------------------------------------

/// Failure-accounting gate for one logical channel
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Timestamp>,
    half_open_successes: u32,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            half_open_successes: 0,
            probe_in_flight: false,
        }
    }

    /// Whether an attempt may proceed right now.
    ///
    /// While open, returns false until `reset_timeout` has elapsed since the
    /// last failure; the first call after that transitions to half-open.
    /// Half-open admits exactly one probe at a time; further attempts are
    /// refused until the outstanding probe records an outcome.
    pub fn can_execute<T: TimeSource + ?Sized>(&mut self, time_source: &T) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let last = match self.last_failure_at {
                    Some(ts) => ts,
                    None => return true,
                };
                if time_source.now().duration_since(last) >= self.config.reset_timeout {
                    debug!(state = "half_open", "circuit breaker probing recovery");
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.probe_in_flight = false;
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.required_successes {
                    debug!(state = "closed", "circuit breaker recovered");
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.last_failure_at = None;
                    self.half_open_successes = 0;
                }
            }
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                self.last_failure_at = None;
            }
            // Success while open can only come from an attempt admitted
            // before the breaker tripped; treat it as recovery evidence.
            BreakerState::Open => {
                self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
            }
        }
    }

    /// Record a failed attempt.
    ///
    /// Callers must not invoke this for environment-teardown failures; those
    /// are reported to the caller but excluded from breaker accounting.
    pub fn record_failure<T: TimeSource + ?Sized>(&mut self, time_source: &T) {
        self.last_failure_at = Some(time_source.now());
        match self.state {
            BreakerState::HalfOpen => {
                debug!(state = "open", "circuit breaker probe failed, reopening");
                self.state = BreakerState::Open;
                self.half_open_successes = 0;
                self.probe_in_flight = false;
            }
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    debug!(
                        failures = self.consecutive_failures,
                        state = "open",
                        "circuit breaker opened"
                    );
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Release the probe slot for an attempt that ended without a breaker
    /// outcome (environment teardown mid-probe)
    pub fn release_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time until the next probe would be permitted (zero when executable)
    pub fn retry_after<T: TimeSource + ?Sized>(&self, time_source: &T) -> Duration {
        match (self.state, self.last_failure_at) {
            (BreakerState::Open, Some(last)) => {
                let elapsed = time_source.now().duration_since(last);
                self.config.reset_timeout.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        }
    }

    /// Snapshot for error payloads and statistics
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
