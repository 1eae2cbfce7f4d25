//! Core types for the Crosslink coordination layer
//!
//! This module defines the fundamental types used throughout the layer,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Request Identifier
// ----------------------------------------------------------------------------

/// Caller-generated, globally unique identifier for a logical operation.
///
/// All wire messages belonging to one operation carry the same id; the
/// RequestTracker enforces at most one live request per id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing identifier
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable on the wire
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= 128
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tab / Correlation Identifiers
// ----------------------------------------------------------------------------

/// Identifier of the browser tab a content-script context belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabId(u32);

impl TabId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab:{}", self.0)
    }
}

/// Correlation identifier linking an operation to a UI interaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Execution Context
// ----------------------------------------------------------------------------

/// An isolated JavaScript-style execution context participating in the
/// messaging layer.
///
/// Contexts share no memory and guarantee no continuous liveness: the
/// background worker may be evicted at any time and content scripts vanish
/// with their frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "surface", rename_all = "camelCase")]
pub enum ExecutionContext {
    /// The background/service worker (hub of most traffic)
    Background,
    /// A per-tab, per-frame content script
    #[serde(rename_all = "camelCase")]
    ContentScript { tab_id: TabId, frame_id: u32 },
    /// The browser-action popup
    Popup,
    /// The side panel surface
    Sidepanel,
    /// The options page
    Options,
}

impl ExecutionContext {
    /// Create a content-script context for the main frame of a tab
    pub fn content_script(tab_id: TabId) -> Self {
        Self::ContentScript { tab_id, frame_id: 0 }
    }

    /// Tab this context belongs to, if any
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            Self::ContentScript { tab_id, .. } => Some(*tab_id),
            _ => None,
        }
    }

    /// Whether this is a UI surface (popup/sidepanel/options)
    pub fn is_ui_surface(&self) -> bool {
        matches!(self, Self::Popup | Self::Sidepanel | Self::Options)
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::ContentScript { tab_id, frame_id } => {
                write!(f, "content:{}:{}", tab_id.value(), frame_id)
            }
            Self::Popup => write!(f, "popup"),
            Self::Sidepanel => write!(f, "sidepanel"),
            Self::Options => write!(f, "options"),
        }
    }
}

// ----------------------------------------------------------------------------
// Priority and Operation Mode
// ----------------------------------------------------------------------------

/// Scheduling hint for an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// How an operation's result is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Single request, single result
    Regular,
    /// Result arrives as partial updates followed by a completion
    Streaming,
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since another timestamp (saturating)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, millis: u64) -> Timestamp {
        Timestamp(self.0 + millis)
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps to the state machines
///
/// Injecting the clock keeps the breaker, tracker and sweep logic testable
/// without timers.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a clock starting at the given timestamp
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
