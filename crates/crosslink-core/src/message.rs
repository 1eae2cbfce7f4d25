//! Wire message model for the Crosslink coordination layer
//!
//! Every message crossing a context boundary is one of the tagged variants
//! below. Messages are validated at the transport boundary before dispatch;
//! nothing duck-typed reaches the routing layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CrosslinkError, Result};
use crate::types::{ExecutionContext, RequestId};

// ----------------------------------------------------------------------------
// Error Info
// ----------------------------------------------------------------------------

/// Error payload carried on the wire (`error: {message, type}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable description
    pub message: String,
    /// Stable machine-readable error kind
    #[serde(rename = "type")]
    pub kind: String,
}

impl ErrorInfo {
    pub fn new<M: Into<String>, K: Into<String>>(message: M, kind: K) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Wire Message
// ----------------------------------------------------------------------------

/// A message crossing a context boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireMessage {
    /// An operation request
    #[serde(rename_all = "camelCase")]
    Request {
        action: String,
        message_id: RequestId,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ExecutionContext>,
    },
    /// Lightweight acknowledgment: accepted, result pending
    #[serde(rename_all = "camelCase")]
    Ack {
        message_id: RequestId,
        /// Destination chose the streaming path for this operation
        #[serde(default)]
        streaming: bool,
    },
    /// Final result for an operation
    #[serde(rename_all = "camelCase")]
    Result {
        message_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    /// Partial update of a streaming operation (non-terminal)
    #[serde(rename_all = "camelCase")]
    StreamUpdate {
        message_id: RequestId,
        seq: u64,
        data: Value,
    },
    /// Terminal message of a streaming operation
    #[serde(rename_all = "camelCase")]
    StreamEnd {
        message_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    /// Out-of-band error for an operation
    #[serde(rename_all = "camelCase")]
    Error {
        message_id: RequestId,
        error: ErrorInfo,
    },
}

impl WireMessage {
    /// Build a request message
    pub fn request<A: Into<String>>(
        action: A,
        message_id: RequestId,
        data: Value,
        context: Option<ExecutionContext>,
    ) -> Self {
        Self::Request {
            action: action.into(),
            message_id,
            data,
            context,
        }
    }

    /// Build a successful result message
    pub fn result_ok(message_id: RequestId, data: Value) -> Self {
        Self::Result {
            message_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build a failed result message
    pub fn result_err(message_id: RequestId, error: ErrorInfo) -> Self {
        Self::Result {
            message_id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// The operation id this message belongs to
    pub fn message_id(&self) -> &RequestId {
        match self {
            Self::Request { message_id, .. }
            | Self::Ack { message_id, .. }
            | Self::Result { message_id, .. }
            | Self::StreamUpdate { message_id, .. }
            | Self::StreamEnd { message_id, .. }
            | Self::Error { message_id, .. } => message_id,
        }
    }

    /// Whether this message terminates a waiter for its id
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Result { .. } | Self::StreamEnd { .. } | Self::Error { .. }
        )
    }

    /// Validate the message at the transport boundary
    pub fn validate(&self) -> Result<()> {
        if !self.message_id().is_valid() {
            return Err(CrosslinkError::invalid_message("empty or oversized message id"));
        }
        match self {
            Self::Request { action, .. } => {
                if action.is_empty() {
                    return Err(CrosslinkError::invalid_message("empty action"));
                }
                if action.len() > 128 {
                    return Err(CrosslinkError::invalid_message("action too long"));
                }
            }
            Self::Result { success, error, .. } | Self::StreamEnd { success, error, .. } => {
                if !success && error.is_none() {
                    return Err(CrosslinkError::invalid_message(
                        "failure without error payload",
                    ));
                }
            }
            Self::Error { error, .. } => {
                if error.message.is_empty() {
                    return Err(CrosslinkError::invalid_message("empty error message"));
                }
            }
            Self::Ack { .. } | Self::StreamUpdate { .. } => {}
        }
        Ok(())
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize and validate from the JSON wire format
    pub fn from_json(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw)?;
        message.validate()?;
        Ok(message)
    }
}

// ----------------------------------------------------------------------------
// Fast-Exchange Reply
// ----------------------------------------------------------------------------

/// Reply to the fast request/ACK exchange
/// (`{success, ack?, result?, error?}` on the wire)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastReply {
    pub success: bool,
    #[serde(default)]
    pub ack: bool,
    /// Destination chose the streaming path
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Classified fast-exchange outcome
#[derive(Debug, Clone, PartialEq)]
pub enum FastReplyKind {
    /// Full result returned immediately
    Completed(Value),
    /// Accepted, result pending (ACK-without-result is expected, not an error)
    Accepted { streaming: bool },
    /// Destination-reported failure; never auto-retried
    Failed(ErrorInfo),
}

impl FastReply {
    /// Full result returned in the fast exchange
    pub fn completed(result: Value) -> Self {
        Self {
            success: true,
            ack: false,
            streaming: false,
            result: Some(result),
            error: None,
        }
    }

    /// ACK-only reply: accepted, result will follow
    pub fn accepted() -> Self {
        Self {
            success: true,
            ack: true,
            streaming: false,
            result: None,
            error: None,
        }
    }

    /// ACK-only reply signalling that the destination will stream
    pub fn streaming_started() -> Self {
        Self {
            success: true,
            ack: true,
            streaming: true,
            result: None,
            error: None,
        }
    }

    /// Destination-reported failure
    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            ack: false,
            streaming: false,
            result: None,
            error: Some(error),
        }
    }

    /// Classify the reply into its protocol meaning
    pub fn classify(self) -> FastReplyKind {
        if !self.success {
            let error = self
                .error
                .unwrap_or_else(|| ErrorInfo::new("destination reported failure", "destination"));
            return FastReplyKind::Failed(error);
        }
        match self.result {
            Some(value) => FastReplyKind::Completed(value),
            None => FastReplyKind::Accepted {
                streaming: self.streaming,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
