//! In-memory transport link
//!
//! Connects two endpoints through unbounded channels, with fault injection
//! for exercising the retry, breaker and invalidation paths. Used by the
//! integration tests and by simulations; production builds wire a real
//! boundary behind the same trait.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::trace;

use crosslink_core::errors::{CrosslinkError, TransportError};
use crosslink_core::message::{FastReply, WireMessage};
use crosslink_core::router::SenderInfo;
use crosslink_core::types::ExecutionContext;
use crosslink_core::Result;

use super::{inbound_channel, Inbound, InboundReceiver, InboundSender, Transport};

// ----------------------------------------------------------------------------
// Fault Injection
// ----------------------------------------------------------------------------

/// Shared fault-injection switches for one direction of a link
#[derive(Debug, Default)]
pub struct LinkFaults {
    /// Swallow this many upcoming fast exchanges (caller sees ACK timeout)
    drop_requests: AtomicU32,
    /// Refuse sends with a channel-closed error
    closed: AtomicBool,
    /// Refuse sends reporting environment teardown
    invalidated: AtomicBool,
}

impl LinkFaults {
    /// Drop the next `n` fast exchanges on the floor
    pub fn drop_next_requests(&self, n: u32) {
        self.drop_requests.store(n, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Simulate environment teardown under the sender
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    fn take_drop(&self) -> bool {
        self.drop_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ----------------------------------------------------------------------------
// Memory Transport
// ----------------------------------------------------------------------------

/// Transport half of an in-memory link
pub struct MemTransport {
    destination: String,
    local_context: ExecutionContext,
    peer: InboundSender,
    faults: Arc<LinkFaults>,
}

#[async_trait]
impl Transport for MemTransport {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send_request(&self, message: WireMessage, sender: SenderInfo) -> Result<FastReply> {
        self.check_faults()?;
        if self.faults.take_drop() {
            trace!(destination = %self.destination, "dropping fast exchange (injected fault)");
            // Never resolves; the caller's ACK timeout fires.
            return futures::future::pending().await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.peer
            .send(Inbound::Request {
                message,
                sender,
                reply: reply_tx,
            })
            .map_err(|_| {
                CrosslinkError::from(TransportError::ChannelClosed {
                    reason: "peer endpoint dropped".into(),
                })
            })?;
        reply_rx.await.map_err(|_| {
            // Peer dropped the reply slot without answering
            CrosslinkError::from(TransportError::SendFailed {
                reason: "peer dropped reply".into(),
            })
        })
    }

    async fn send(&self, message: WireMessage) -> Result<()> {
        self.check_faults()?;
        self.peer.send(Inbound::Notice { message }).map_err(|_| {
            CrosslinkError::from(TransportError::ChannelClosed {
                reason: "peer endpoint dropped".into(),
            })
        })
    }
}

impl MemTransport {
    fn check_faults(&self) -> Result<()> {
        if self.faults.invalidated.load(Ordering::SeqCst) {
            return Err(CrosslinkError::context_invalidated(
                "in-memory context torn down",
            ));
        }
        if self.faults.closed.load(Ordering::SeqCst) {
            return Err(CrosslinkError::from(TransportError::ChannelClosed {
                reason: "link closed".into(),
            }));
        }
        Ok(())
    }

    /// Context this endpoint presents itself as when sending
    pub fn local_context(&self) -> &ExecutionContext {
        &self.local_context
    }
}

// ----------------------------------------------------------------------------
// Endpoint and Link Construction
// ----------------------------------------------------------------------------

/// One side of an in-memory link
pub struct MemEndpoint {
    transport: Arc<MemTransport>,
    inbound: Option<InboundReceiver>,
    faults: Arc<LinkFaults>,
}

impl MemEndpoint {
    /// Transport used to send toward the peer
    pub fn transport(&self) -> Arc<MemTransport> {
        Arc::clone(&self.transport)
    }

    /// Take the stream of messages arriving at this endpoint. Yields `None`
    /// after the first call.
    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        self.inbound.take()
    }

    /// Fault-injection switches for sends leaving this endpoint
    pub fn faults(&self) -> Arc<LinkFaults> {
        Arc::clone(&self.faults)
    }
}

/// Build a bidirectional in-memory link between two contexts
pub fn link(a: ExecutionContext, b: ExecutionContext) -> (MemEndpoint, MemEndpoint) {
    let (to_a, a_inbound) = inbound_channel();
    let (to_b, b_inbound) = inbound_channel();
    let a_faults = Arc::new(LinkFaults::default());
    let b_faults = Arc::new(LinkFaults::default());

    let a_endpoint = MemEndpoint {
        transport: Arc::new(MemTransport {
            destination: b.to_string(),
            local_context: a.clone(),
            peer: to_b,
            faults: Arc::clone(&a_faults),
        }),
        inbound: Some(a_inbound),
        faults: a_faults,
    };
    let b_endpoint = MemEndpoint {
        transport: Arc::new(MemTransport {
            destination: a.to_string(),
            local_context: b,
            peer: to_a,
            faults: b_faults.clone(),
        }),
        inbound: Some(b_inbound),
        faults: b_faults,
    };
    (a_endpoint, b_endpoint)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
