//! Crosslink Runtime Engine
//!
//! This crate contains the async engine for the Crosslink coordination
//! layer, including:
//! - `CrosslinkRuntime`: task owner wiring the component graph together
//! - `Coordinator`: request lifecycle orchestration on both channel sides
//! - `TransportChannel`: the fast-ACK/durable-RESULT exchange with breaker
//!   gating and retry policy
//! - Streaming demultiplexing with adaptive silence timeouts
//! - `ResultDispatcher`: at-most-once finalization and queued delivery
//!
//! This is the "engine"; `crosslink-core` provides the pure state machines
//! and wire definitions it drives.

pub mod channel;
pub mod coordinator;
pub mod dispatcher;
pub mod runtime;
pub mod streaming;
pub mod transport;

pub use channel::{ChannelOutcome, ChannelStats, DurableOutcome, TransportChannel};
pub use coordinator::{Coordinator, Submission};
pub use dispatcher::{
    DispatchOutcome, DispatcherStats, FlushReport, RecordingSink, ResultDelivery, ResultDispatcher,
    ResultSink,
};
pub use runtime::CrosslinkRuntime;
pub use streaming::{
    StreamEvent, StreamExpiry, StreamingResponseHandler, StreamingTimeoutManager,
};
pub use transport::{mem, Inbound, InboundReceiver, InboundSender, Transport};

// Re-export core types for convenience
pub use crosslink_core::{
    CircuitBreakerConfig, CrosslinkConfig, CrosslinkError, ErrorInfo, ExecutionContext,
    HandlerOutcome, OperationRequest, RequestId, RequestStatus, Result, SenderInfo, TabId,
    TransportError, WireMessage,
};
