//! Centralized configuration for the Crosslink coordination layer
//!
//! All tunables used by the state machines and the runtime live here, as one
//! aggregate with per-component sections, defaults, validation and a testing
//! preset.

use core::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Circuit Breaker Configuration
// ----------------------------------------------------------------------------

/// Configuration for per-channel circuit breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time the breaker stays open before permitting a probe
    pub reset_timeout: Duration,
    /// Half-open successes required to close the breaker again
    pub required_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 4,
            reset_timeout: Duration::from_secs(30),
            required_successes: 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Configuration for the TransportChannel's fast/durable protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bound on the fast request/ACK exchange
    pub ack_timeout: Duration,
    /// Extra fast-exchange attempts after the first (idempotent ops only)
    pub max_fast_retries: u32,
    /// Initial retry delay for the exponential backoff
    pub initial_retry_delay: Duration,
    /// Ceiling for the backoff delay
    pub max_retry_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Fractional jitter applied to each backoff delay (0.0..1.0)
    pub jitter_ratio: f64,
    /// Ceiling on how long a detached late-result wait may linger
    pub late_result_ceiling: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            max_fast_retries: 2,
            initial_retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            late_result_ceiling: Duration::from_secs(300),
        }
    }
}

// ----------------------------------------------------------------------------
// Tracker Configuration
// ----------------------------------------------------------------------------

/// Configuration for the RequestTracker's retention and sweep behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How long terminal entries are retained for duplicate detection
    pub terminal_retention: Duration,
    /// Ceiling after which stuck non-terminal entries are reaped
    pub stuck_ceiling: Duration,
    /// Interval of the periodic sweep
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            terminal_retention: Duration::from_secs(120),
            stuck_ceiling: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Streaming Configuration
// ----------------------------------------------------------------------------

/// Configuration for streaming selection and adaptive timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Flat text above this length goes through the streaming path
    pub text_length_threshold: usize,
    /// Structured payloads with more items than this stream
    pub item_count_threshold: usize,
    /// Characters per estimated work segment
    pub chars_per_segment: usize,
    /// Base initial timeout before any progress is required
    pub base_initial_timeout: Duration,
    /// Initial-timeout increment per estimated segment
    pub per_segment_initial: Duration,
    /// Base allowance for silence between progress events
    pub base_progress_timeout: Duration,
    /// Progress-timeout increment per estimated segment
    pub per_segment_progress: Duration,
    /// Base extra time granted after a late progress event
    pub base_grace_period: Duration,
    /// Grace-period increment per estimated segment
    pub per_segment_grace: Duration,
    /// Hard ceiling for every computed timeout and for total stream lifetime
    pub hard_ceiling: Duration,
    /// Per-id FIFO capacity for messages arriving before waiter registration
    pub early_buffer_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            text_length_threshold: 1000,
            item_count_threshold: 4,
            chars_per_segment: 500,
            base_initial_timeout: Duration::from_secs(10),
            per_segment_initial: Duration::from_secs(2),
            base_progress_timeout: Duration::from_secs(8),
            per_segment_progress: Duration::from_millis(500),
            base_grace_period: Duration::from_secs(3),
            per_segment_grace: Duration::from_millis(250),
            hard_ceiling: Duration::from_secs(5 * 60),
            early_buffer_capacity: 16,
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatcher Configuration
// ----------------------------------------------------------------------------

/// Configuration for result delivery behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Interval of the queued-result flush timer
    pub queue_flush_interval: Duration,
    /// Maximum age of a queued result before it is dropped
    pub queue_max_age: Duration,
    /// Delivery attempts per result before finalizing as failed
    pub max_delivery_attempts: u32,
    /// Linear backoff step between delivery attempts
    pub delivery_backoff_step: Duration,
    /// Results at or above this byte size broadcast instead of targeting
    pub large_result_threshold: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_flush_interval: Duration::from_secs(2),
            queue_max_age: Duration::from_secs(30),
            max_delivery_attempts: 3,
            delivery_backoff_step: Duration::from_millis(500),
            large_result_threshold: 64 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Timeout Classes
// ----------------------------------------------------------------------------

/// Durations backing the per-action timeout classes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutClassConfig {
    /// Status and settings actions (1-3s band)
    pub short: Duration,
    /// Standard operations (6-20s band)
    pub medium: Duration,
    /// Bulk/capture/media actions (15-35s band)
    pub long: Duration,
    /// Unlisted actions
    pub default: Duration,
}

impl Default for TimeoutClassConfig {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(2),
            medium: Duration::from_secs(12),
            long: Duration::from_secs(30),
            default: Duration::from_secs(8),
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate Configuration
// ----------------------------------------------------------------------------

/// Aggregate configuration for a Crosslink runtime instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrosslinkConfig {
    pub breaker: CircuitBreakerConfig,
    pub delivery: DeliveryConfig,
    pub tracker: TrackerConfig,
    pub streaming: StreamingConfig,
    pub dispatcher: DispatcherConfig,
    pub timeouts: TimeoutClassConfig,
}

impl CrosslinkConfig {
    /// Validate cross-field invariants
    pub fn validate(&self) -> Result<(), String> {
        if self.breaker.failure_threshold == 0 {
            return Err("breaker.failure_threshold must be at least 1".into());
        }
        if self.breaker.required_successes == 0 {
            return Err("breaker.required_successes must be at least 1".into());
        }
        if self.delivery.backoff_multiplier < 1.0 {
            return Err("delivery.backoff_multiplier must be >= 1.0".into());
        }
        if !(0.0..1.0).contains(&self.delivery.jitter_ratio) {
            return Err("delivery.jitter_ratio must be in [0.0, 1.0)".into());
        }
        if self.delivery.initial_retry_delay > self.delivery.max_retry_delay {
            return Err("delivery.initial_retry_delay exceeds max_retry_delay".into());
        }
        if self.tracker.terminal_retention >= self.tracker.stuck_ceiling {
            return Err("tracker.terminal_retention must be shorter than stuck_ceiling".into());
        }
        if self.streaming.chars_per_segment == 0 {
            return Err("streaming.chars_per_segment must be at least 1".into());
        }
        if self.streaming.early_buffer_capacity == 0 {
            return Err("streaming.early_buffer_capacity must be at least 1".into());
        }
        if self.streaming.base_initial_timeout > self.streaming.hard_ceiling {
            return Err("streaming.base_initial_timeout exceeds hard_ceiling".into());
        }
        if self.dispatcher.max_delivery_attempts == 0 {
            return Err("dispatcher.max_delivery_attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Short-duration preset for tests
    pub fn testing() -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                failure_threshold: 4,
                reset_timeout: Duration::from_millis(200),
                required_successes: 2,
            },
            delivery: DeliveryConfig {
                ack_timeout: Duration::from_millis(50),
                max_fast_retries: 0,
                initial_retry_delay: Duration::from_millis(10),
                max_retry_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
                jitter_ratio: 0.0,
                late_result_ceiling: Duration::from_secs(5),
            },
            tracker: TrackerConfig {
                terminal_retention: Duration::from_millis(500),
                stuck_ceiling: Duration::from_secs(5),
                sweep_interval: Duration::from_millis(100),
            },
            streaming: StreamingConfig {
                base_initial_timeout: Duration::from_millis(500),
                per_segment_initial: Duration::from_millis(50),
                base_progress_timeout: Duration::from_millis(300),
                per_segment_progress: Duration::from_millis(20),
                base_grace_period: Duration::from_millis(100),
                per_segment_grace: Duration::from_millis(10),
                hard_ceiling: Duration::from_secs(5),
                ..StreamingConfig::default()
            },
            dispatcher: DispatcherConfig {
                queue_flush_interval: Duration::from_millis(50),
                queue_max_age: Duration::from_millis(500),
                max_delivery_attempts: 2,
                delivery_backoff_step: Duration::from_millis(10),
                ..DispatcherConfig::default()
            },
            timeouts: TimeoutClassConfig {
                short: Duration::from_millis(100),
                medium: Duration::from_millis(400),
                long: Duration::from_millis(800),
                default: Duration::from_millis(300),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
