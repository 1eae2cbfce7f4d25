//! Transport abstraction for context boundaries
//!
//! A [`Transport`] carries wire messages across one context boundary. The
//! engine never touches browser messaging APIs directly; it talks to this
//! trait, so tests and simulations plug in the in-memory link from
//! [`mem`] without touching protocol code.

pub mod mem;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crosslink_core::message::{FastReply, WireMessage};
use crosslink_core::router::SenderInfo;
use crosslink_core::Result;

// ----------------------------------------------------------------------------
// Inbound Envelopes
// ----------------------------------------------------------------------------

/// A message arriving at this endpoint from the far side
#[derive(Debug)]
pub enum Inbound {
    /// A request wanting a fast reply before its channel closes
    Request {
        message: WireMessage,
        sender: SenderInfo,
        reply: oneshot::Sender<FastReply>,
    },
    /// A one-way message (durable result, stream traffic, errors)
    Notice { message: WireMessage },
}

impl Inbound {
    pub fn message(&self) -> &WireMessage {
        match self {
            Self::Request { message, .. } | Self::Notice { message } => message,
        }
    }
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Create the inbound channel wiring for one endpoint
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// One context boundary the engine can send across.
///
/// Implementations signal environment teardown with
/// [`CrosslinkError::ContextInvalidated`](crosslink_core::CrosslinkError) and
/// transient faults with [`CrosslinkError::Transport`](crosslink_core::CrosslinkError);
/// the channel treats the two very differently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Label of the destination this transport reaches (for logs and errors)
    fn destination(&self) -> &str;

    /// Fast exchange: deliver a request and await the peer's immediate reply.
    /// The caller bounds this with its own ACK timeout.
    async fn send_request(&self, message: WireMessage, sender: SenderInfo) -> Result<FastReply>;

    /// One-way delivery of a non-request message
    async fn send(&self, message: WireMessage) -> Result<()>;
}
