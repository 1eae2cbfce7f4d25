//! Action-based message routing
//!
//! The receiving side of a channel registers one async handler per action
//! string. Dispatch looks the handler up by exact action name; an unknown
//! action is the caller's problem to surface, not the router's.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ExecutionContext, RequestId};

// ----------------------------------------------------------------------------
// Handler Types
// ----------------------------------------------------------------------------

/// What a handler chose to do with a request
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Finished synchronously (fast-path): reply carries the full result
    Reply(Value),
    /// Accepted; a durable RESULT will be produced later
    WillRespondLater,
    /// Accepted; results will arrive as a stream for this id
    Streaming,
}

/// Metadata about the sender of a dispatched request
#[derive(Debug, Clone, PartialEq)]
pub struct SenderInfo {
    /// Context the request came from, if it identified itself
    pub context: Option<ExecutionContext>,
    /// Operation id of the dispatched request; handlers deferring their
    /// result use this to produce it later
    pub request_id: Option<RequestId>,
}

impl SenderInfo {
    pub fn new(context: Option<ExecutionContext>) -> Self {
        Self {
            context,
            request_id: None,
        }
    }

    pub fn for_request(context: Option<ExecutionContext>, request_id: RequestId) -> Self {
        Self {
            context,
            request_id: Some(request_id),
        }
    }

    pub fn unknown() -> Self {
        Self {
            context: None,
            request_id: None,
        }
    }
}

/// Async handler for one action
pub type HandlerFn =
    Arc<dyn Fn(Value, SenderInfo) -> BoxFuture<'static, Result<HandlerOutcome>> + Send + Sync>;

// ----------------------------------------------------------------------------
// Message Router
// ----------------------------------------------------------------------------

/// Registry mapping action strings to handlers
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<String, HandlerFn>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action. Re-registering replaces the previous
    /// handler and logs a warning.
    pub fn register<A, F>(&mut self, action: A, handler: F)
    where
        A: Into<String>,
        F: Fn(Value, SenderInfo) -> BoxFuture<'static, Result<HandlerOutcome>>
            + Send
            + Sync
            + 'static,
    {
        let action = action.into();
        if self.handlers.insert(action.clone(), Arc::new(handler)).is_some() {
            warn!(action = %action, "replacing existing handler");
        } else {
            debug!(action = %action, "handler registered");
        }
    }

    /// Remove a handler
    pub fn unregister(&mut self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    /// Look up and invoke the handler for an action. Returns `None` when no
    /// handler is registered.
    pub fn dispatch(
        &self,
        action: &str,
        payload: Value,
        sender: SenderInfo,
    ) -> Option<BoxFuture<'static, Result<HandlerOutcome>>> {
        let handler = self.handlers.get(action)?;
        Some(handler(payload, sender))
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Sorted list of registered action names
    pub fn registered_actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("actions", &self.registered_actions())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
