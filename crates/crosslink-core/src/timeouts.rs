//! Timeout classification and adaptive streaming timeout math
//!
//! Actions fall into named timeout classes rather than carrying ad-hoc
//! durations. Streaming operations get adaptive windows scaled by an
//! estimate of the work in the payload, with every computed value clamped
//! to one hard ceiling.

use core::time::Duration;

use serde_json::Value;

use crate::config::{StreamingConfig, TimeoutClassConfig};

// ----------------------------------------------------------------------------
// Timeout Classes
// ----------------------------------------------------------------------------

/// Named timeout class an action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Status and settings actions
    Short,
    /// Standard single-shot operations
    Medium,
    /// Bulk, capture and media actions
    Long,
    /// Anything not explicitly listed
    Default,
}

impl TimeoutClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::Default => "default",
        }
    }

    /// Resolve the class against the configured durations
    pub fn duration(&self, config: &TimeoutClassConfig) -> Duration {
        match self {
            Self::Short => config.short,
            Self::Medium => config.medium,
            Self::Long => config.long,
            Self::Default => config.default,
        }
    }
}

const SHORT_ACTIONS: &[&str] = &[
    "status.ping",
    "settings.get",
    "settings.set",
    "cache.get",
    "cache.clear",
];

const MEDIUM_ACTIONS: &[&str] = &[
    "translate.text",
    "translate.selection",
    "language.detect",
    "glossary.lookup",
];

const LONG_ACTIONS: &[&str] = &[
    "translate.page",
    "translate.batch",
    "capture.screen",
    "media.transcribe",
];

/// Classify an action string into its timeout class
pub fn class_for_action(action: &str) -> TimeoutClass {
    if SHORT_ACTIONS.contains(&action) {
        TimeoutClass::Short
    } else if MEDIUM_ACTIONS.contains(&action) {
        TimeoutClass::Medium
    } else if LONG_ACTIONS.contains(&action) {
        TimeoutClass::Long
    } else {
        TimeoutClass::Default
    }
}

/// Durable-result timeout for an action
pub fn timeout_for_action(action: &str, config: &TimeoutClassConfig) -> Duration {
    class_for_action(action).duration(config)
}

// ----------------------------------------------------------------------------
// Streaming Selection and Segment Estimation
// ----------------------------------------------------------------------------

/// Total character weight of a payload's translatable text fields
fn text_weight(payload: &Value) -> usize {
    match payload {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(text_weight).sum(),
        Value::Object(map) => map.values().map(text_weight).sum(),
        _ => 0,
    }
}

/// Number of discrete items a structured payload carries
fn item_count(payload: &Value) -> usize {
    match payload {
        Value::Array(items) => items.len(),
        Value::Object(map) => map
            .get("items")
            .or_else(|| map.get("segments"))
            .or_else(|| map.get("texts"))
            .map(item_count)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Whether a payload is heavy enough to take the streaming path
pub fn is_streaming_payload(payload: &Value, config: &StreamingConfig) -> bool {
    text_weight(payload) > config.text_length_threshold
        || item_count(payload) > config.item_count_threshold
}

/// Estimate the number of work segments in a payload (at least 1)
pub fn estimate_segments(payload: &Value, config: &StreamingConfig) -> usize {
    let by_chars = text_weight(payload).div_ceil(config.chars_per_segment.max(1));
    let by_items = item_count(payload);
    by_chars.max(by_items).max(1)
}

// ----------------------------------------------------------------------------
// Adaptive Streaming Timeouts
// ----------------------------------------------------------------------------

/// Adaptive timeout windows for one streaming operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingTimeouts {
    /// Window before the first progress event is required
    pub initial: Duration,
    /// Allowed silence between progress events
    pub progress: Duration,
    /// Extra time granted when progress lands near the deadline
    pub grace: Duration,
}

impl StreamingTimeouts {
    /// Compute windows for an estimated segment count. Monotone in the
    /// estimate, clamped to the configured hard ceiling.
    pub fn for_segments(segments: usize, config: &StreamingConfig) -> Self {
        let n = segments.max(1) as u32;
        let clamp = |d: Duration| d.min(config.hard_ceiling);
        Self {
            initial: clamp(config.base_initial_timeout + config.per_segment_initial * n),
            progress: clamp(config.base_progress_timeout + config.per_segment_progress * n),
            grace: clamp(config.base_grace_period + config.per_segment_grace * n),
        }
    }

    /// Compute windows directly from a payload
    pub fn for_payload(payload: &Value, config: &StreamingConfig) -> Self {
        Self::for_segments(estimate_segments(payload, config), config)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
