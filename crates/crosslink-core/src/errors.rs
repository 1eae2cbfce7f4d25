//! Error types for the Crosslink coordination layer
//!
//! All terminal failures are surfaced to the caller as a typed error with a
//! message; logging is a side channel only, nothing is silently swallowed.

use crate::message::ErrorInfo;
use crate::types::RequestId;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Transient transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no acknowledgment within {timeout_ms}ms")]
    AckTimeout { timeout_ms: u64 },
    #[error("no result within {timeout_ms}ms")]
    ResultTimeout { timeout_ms: u64 },
    #[error("channel closed: {reason}")]
    ChannelClosed { reason: String },
    #[error("send failed: {reason}")]
    SendFailed { reason: String },
    #[error("destination unreachable: {destination}")]
    Unreachable { destination: String },
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error types for the Crosslink coordination layer
#[derive(Debug, thiserror::Error)]
pub enum CrosslinkError {
    /// Transient transport failure; retried per backoff before surfacing
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The execution environment was torn down (extension/context
    /// invalidated). Never retried, never counted by the circuit breaker.
    #[error("execution context invalidated: {reason}")]
    ContextInvalidated { reason: String },

    /// Circuit breaker rejected the attempt without any I/O
    #[error("circuit open for {destination}, retry in {retry_after_ms}ms")]
    CircuitOpen {
        destination: String,
        retry_after_ms: u64,
    },

    /// Destination processed the request and reported failure; never
    /// auto-retried, propagated as-is
    #[error("destination failure ({kind}): {message}")]
    Destination { kind: String, message: String },

    /// Duplicate submission while the original is still in flight
    #[error("request {id} is still processing")]
    StillProcessing { id: RequestId },

    /// Operation id is not tracked
    #[error("unknown request {id}")]
    UnknownRequest { id: RequestId },

    /// Attempted a backward or illegal status transition
    #[error("illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: RequestId,
        from: &'static str,
        to: &'static str,
    },

    /// Operation already reached a terminal state
    #[error("request {id} is already terminal ({status})")]
    AlreadyTerminal {
        id: RequestId,
        status: &'static str,
    },

    /// Operation was cancelled cooperatively
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// Streaming operation saw no progress within its adaptive window.
    /// This is a soft timeout: underlying work may continue and deliver a
    /// late completion.
    #[error("stream {id} timed out after {silent_for_ms}ms without progress")]
    StreamTimeout { id: RequestId, silent_for_ms: u64 },

    /// Wire serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message rejected at the transport boundary
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Configuration error
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Internal channel/wiring error
    #[error("internal channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Constructors and Classification
// ----------------------------------------------------------------------------

impl CrosslinkError {
    /// Create a context-invalidated error
    pub fn context_invalidated<T: Into<String>>(reason: T) -> Self {
        Self::ContextInvalidated {
            reason: reason.into(),
        }
    }

    /// Create a destination-reported failure
    pub fn destination<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self::Destination {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-message error
    pub fn invalid_message<T: Into<String>>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an internal channel error
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind, used for the wire `error.type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(TransportError::AckTimeout { .. }) => "ack_timeout",
            Self::Transport(TransportError::ResultTimeout { .. }) => "result_timeout",
            Self::Transport(TransportError::ChannelClosed { .. }) => "channel_closed",
            Self::Transport(TransportError::SendFailed { .. }) => "send_failed",
            Self::Transport(TransportError::Unreachable { .. }) => "unreachable",
            Self::ContextInvalidated { .. } => "context_invalidated",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Destination { .. } => "destination",
            Self::StillProcessing { .. } => "still_processing",
            Self::UnknownRequest { .. } => "unknown_request",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::Cancelled { .. } => "cancelled",
            Self::StreamTimeout { .. } => "stream_timeout",
            Self::Serialization(_) => "serialization",
            Self::InvalidMessage { .. } => "invalid_message",
            Self::Configuration { .. } => "configuration",
            Self::Channel { .. } => "channel",
        }
    }

    /// Whether the environment was torn down underneath the operation
    pub fn is_context_invalidated(&self) -> bool {
        matches!(self, Self::ContextInvalidated { .. })
    }

    /// Whether a retry of the same attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Convert into the wire error payload.
    ///
    /// Destination-reported failures keep their original `{message, type}`
    /// pair so the wire round-trip is lossless.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Destination { kind, message } => ErrorInfo::new(message.clone(), kind.clone()),
            _ => ErrorInfo::new(self.to_string(), self.kind()),
        }
    }
}

impl From<&CrosslinkError> for ErrorInfo {
    fn from(err: &CrosslinkError) -> Self {
        err.to_error_info()
    }
}

impl From<ErrorInfo> for CrosslinkError {
    fn from(info: ErrorInfo) -> Self {
        CrosslinkError::Destination {
            kind: info.kind,
            message: info.message,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CrosslinkError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
