//! Crosslink Core Coordination Primitives
//!
//! This crate provides the pure state machines, wire message model and
//! configuration for the Crosslink cross-context coordination layer. Nothing
//! in here owns a task or a timer; time enters only through the
//! [`types::TimeSource`] trait, so every state machine is deterministic under
//! test. The async engine that drives these types lives in
//! `crosslink-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod breaker;
pub mod config;
pub mod errors;
pub mod message;
pub mod router;
pub mod timeouts;
pub mod tracker;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::{
    CircuitBreakerConfig, CrosslinkConfig, DeliveryConfig, DispatcherConfig, StreamingConfig,
    TimeoutClassConfig, TrackerConfig,
};
pub use errors::{CrosslinkError, Result, TransportError};
pub use message::{ErrorInfo, FastReply, FastReplyKind, WireMessage};
pub use router::{HandlerFn, HandlerOutcome, MessageRouter, SenderInfo};
pub use timeouts::{
    class_for_action, estimate_segments, is_streaming_payload, timeout_for_action,
    StreamingTimeouts, TimeoutClass,
};
pub use tracker::{
    AdmitOutcome, CompletionRecord, ElementRef, OperationRequest, RequestStatus, RequestTracker,
    SweepReport, TrackedRequest, TrackerStats,
};
pub use types::{
    CorrelationId, ExecutionContext, ManualTimeSource, OperationMode, Priority, RequestId,
    SystemTimeSource, TabId, TimeSource, Timestamp,
};
