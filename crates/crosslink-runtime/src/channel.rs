//! Sender-side transport channel
//!
//! Implements the two-part exchange over a [`Transport`]: a fast
//! request/ACK bounded by a short timeout, then a durable RESULT that
//! arrives as an independent message and is matched back to its waiter by
//! id. Owns the per-channel circuit breaker and the retry/backoff policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crosslink_core::breaker::{BreakerSnapshot, CircuitBreaker};
use crosslink_core::config::{CircuitBreakerConfig, DeliveryConfig};
use crosslink_core::errors::{CrosslinkError, TransportError};
use crosslink_core::message::{ErrorInfo, FastReplyKind, WireMessage};
use crosslink_core::router::SenderInfo;
use crosslink_core::types::{RequestId, TimeSource};
use crosslink_core::Result;

use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Outcome of the fast exchange
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    /// Destination finished synchronously; full result in hand
    Completed(Value),
    /// Destination accepted; durable RESULT (or stream) will follow
    Accepted { streaming: bool },
    /// Fast exchange went unanswered; the request was resent over the
    /// durable path and the RESULT must be awaited
    Resent,
}

/// Durable outcome delivered for an id
pub type DurableOutcome = core::result::Result<Value, ErrorInfo>;

// ----------------------------------------------------------------------------
// Transport Channel
// ----------------------------------------------------------------------------

/// Reliable request channel over one transport boundary
pub struct TransportChannel {
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    // Guard is never held across an await point
    breaker: Mutex<CircuitBreaker>,
    time_source: Arc<dyn TimeSource>,
    waiters: DashMap<RequestId, oneshot::Sender<DurableOutcome>>,
    /// Durable outcomes that arrived before (or without) a waiter
    unclaimed: DashMap<RequestId, DurableOutcome>,
    stats: ChannelCounters,
}

#[derive(Debug, Default)]
struct ChannelCounters {
    fast_completed: AtomicU64,
    accepted: AtomicU64,
    retries: AtomicU64,
    durable_fallbacks: AtomicU64,
    rejected_by_breaker: AtomicU64,
    failed: AtomicU64,
}

impl TransportChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
        breaker_config: CircuitBreakerConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            transport,
            config,
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            time_source,
            waiters: DashMap::new(),
            unclaimed: DashMap::new(),
            stats: ChannelCounters::default(),
        }
    }

    /// Destination label of the underlying transport
    pub fn destination(&self) -> String {
        self.transport.destination().to_string()
    }

    /// Run the fast exchange for a request.
    ///
    /// Gated by the circuit breaker; the request/ACK round trip is bounded
    /// by the ACK timeout and retried with jittered exponential backoff for
    /// idempotent operations only. An exhausted fast exchange penalizes the
    /// breaker once, then falls back to a single durable resend — the
    /// destination may be alive and only the reply path lossy. Context
    /// invalidation aborts immediately and leaves the breaker untouched; a
    /// destination-reported failure counts as channel success.
    pub async fn request(
        &self,
        message: WireMessage,
        sender: SenderInfo,
        idempotent: bool,
    ) -> Result<ChannelOutcome> {
        self.check_breaker()?;

        let max_attempts = if idempotent {
            1 + self.config.max_fast_retries
        } else {
            1
        };
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt - 1);
                trace!(attempt, delay_ms = delay.as_millis() as u64, "retrying fast exchange");
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }

            let exchange = self
                .transport
                .send_request(message.clone(), sender.clone());
            match tokio::time::timeout(self.config.ack_timeout, exchange).await {
                Ok(Ok(reply)) => {
                    self.record_success();
                    return Ok(match reply.classify() {
                        FastReplyKind::Completed(value) => {
                            self.stats.fast_completed.fetch_add(1, Ordering::Relaxed);
                            ChannelOutcome::Completed(value)
                        }
                        FastReplyKind::Accepted { streaming } => {
                            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                            ChannelOutcome::Accepted { streaming }
                        }
                        FastReplyKind::Failed(error) => {
                            // The channel worked; the destination said no.
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            return Err(CrosslinkError::from(error));
                        }
                    });
                }
                Ok(Err(err)) if err.is_context_invalidated() => {
                    debug!(destination = %self.transport.destination(), "context invalidated mid-exchange");
                    // No breaker outcome for a teardown; free the probe slot
                    self.release_probe();
                    return Err(err);
                }
                Ok(Err(err)) if err.is_retryable() => {
                    last_error = Some(err);
                }
                Ok(Err(err)) => {
                    self.record_failure();
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Err(_elapsed) => {
                    last_error = Some(CrosslinkError::from(TransportError::AckTimeout {
                        timeout_ms: self.config.ack_timeout.as_millis() as u64,
                    }));
                }
            }
        }

        // Retries exhausted: one failure against the breaker, not one per
        // attempt.
        self.record_failure();
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            destination = %self.transport.destination(),
            attempts = max_attempts,
            "fast exchange exhausted retries, falling back to durable resend"
        );

        // The destination may be alive with only the reply path lossy: resend
        // once over the durable path and let the caller await the RESULT.
        // Duplicate delivery is safe, the receiving tracker dedups by id.
        match self.transport.send(message).await {
            Ok(()) => {
                self.stats.durable_fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(ChannelOutcome::Resent)
            }
            Err(send_err) => {
                debug!(error = %send_err, "durable resend failed");
                Err(last_error.unwrap_or(send_err))
            }
        }
    }

    /// One-way send of a non-request message
    pub async fn send(&self, message: WireMessage) -> Result<()> {
        self.transport.send(message).await
    }

    // ------------------------------------------------------------------
    // Durable results
    // ------------------------------------------------------------------

    /// Register a waiter for the durable outcome of `id`.
    ///
    /// An outcome that already arrived is handed over immediately through
    /// the returned receiver.
    pub fn register_waiter(&self, id: &RequestId) -> oneshot::Receiver<DurableOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Some((_, outcome)) = self.unclaimed.remove(id) {
            let _ = tx.send(outcome);
        } else {
            self.waiters.insert(id.clone(), tx);
        }
        rx
    }

    /// Await the durable outcome of `id`, bounded by `timeout`
    pub async fn await_result(&self, id: &RequestId, timeout: Duration) -> Result<Value> {
        let rx = self.register_waiter(id);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(CrosslinkError::from(error)),
            Ok(Err(_recv)) => Err(CrosslinkError::channel_error(
                "result waiter dropped before resolution",
            )),
            Err(_elapsed) => {
                self.waiters.remove(id);
                Err(CrosslinkError::from(TransportError::ResultTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
        }
    }

    /// Resolve a waiter from an inbound terminal message. Non-terminal and
    /// stream messages are ignored here. Returns true when the message was
    /// consumed by a waiter; an unmatched outcome is kept for late pickup.
    pub fn resolve_inbound(&self, message: &WireMessage) -> bool {
        let (id, outcome): (&RequestId, DurableOutcome) = match message {
            WireMessage::Result {
                message_id,
                success,
                data,
                error,
            } => {
                let outcome = if *success {
                    Ok(data.clone().unwrap_or(Value::Null))
                } else {
                    Err(error
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::new("unspecified failure", "destination")))
                };
                (message_id, outcome)
            }
            WireMessage::Error { message_id, error } => (message_id, Err(error.clone())),
            _ => return false,
        };

        match self.waiters.remove(id) {
            Some((_, waiter)) => {
                // A durable outcome counts as channel success, the same as
                // an answered fast exchange
                self.record_success();
                if waiter.send(outcome).is_err() {
                    trace!(id = %id, "waiter gone before durable result");
                }
                true
            }
            None => {
                debug!(id = %id, "durable result arrived with no waiter, keeping");
                self.unclaimed.insert(id.clone(), outcome);
                false
            }
        }
    }

    /// Take an outcome that arrived without a waiter
    pub fn take_unclaimed(&self, id: &RequestId) -> Option<DurableOutcome> {
        self.unclaimed.remove(id).map(|(_, outcome)| outcome)
    }

    /// Whether someone is awaiting the durable outcome of `id`
    pub fn has_waiter(&self, id: &RequestId) -> bool {
        self.waiters.contains_key(id)
    }

    /// Drop the waiter for `id`, if any
    pub fn forget_waiter(&self, id: &RequestId) {
        self.waiters.remove(id);
    }

    // ------------------------------------------------------------------
    // Breaker accounting
    // ------------------------------------------------------------------

    fn check_breaker(&self) -> Result<()> {
        let mut breaker = self.breaker.lock().map_err(poisoned)?;
        if breaker.can_execute(self.time_source.as_ref()) {
            Ok(())
        } else {
            self.stats.rejected_by_breaker.fetch_add(1, Ordering::Relaxed);
            let retry_after = breaker.retry_after(self.time_source.as_ref());
            Err(CrosslinkError::CircuitOpen {
                destination: self.transport.destination().to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            })
        }
    }

    fn record_success(&self) {
        if let Ok(mut breaker) = self.breaker.lock() {
            breaker.record_success();
        }
    }

    fn record_failure(&self) {
        if let Ok(mut breaker) = self.breaker.lock() {
            breaker.record_failure(self.time_source.as_ref());
        }
    }

    fn release_probe(&self) {
        if let Ok(mut breaker) = self.breaker.lock() {
            breaker.release_probe();
        }
    }

    /// Breaker view for error payloads and stats
    pub fn breaker_snapshot(&self) -> Result<BreakerSnapshot> {
        Ok(self.breaker.lock().map_err(poisoned)?.snapshot())
    }

    /// Counter snapshot
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            fast_completed: self.stats.fast_completed.load(Ordering::Relaxed),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            durable_fallbacks: self.stats.durable_fallbacks.load(Ordering::Relaxed),
            rejected_by_breaker: self.stats.rejected_by_breaker.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            pending_waiters: self.waiters.len(),
        }
    }

    fn backoff_delay(&self, retry_index: u32) -> Duration {
        let base = self.config.initial_retry_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(retry_index as i32);
        let capped = base.min(self.config.max_retry_delay.as_millis() as f64);
        let jittered = if self.config.jitter_ratio > 0.0 {
            let spread = rand::thread_rng()
                .gen_range(-self.config.jitter_ratio..self.config.jitter_ratio);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CrosslinkError {
    CrosslinkError::channel_error("breaker lock poisoned")
}

/// Point-in-time channel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub fast_completed: u64,
    pub accepted: u64,
    pub retries: u64,
    pub durable_fallbacks: u64,
    pub rejected_by_breaker: u64,
    pub failed: u64,
    pub pending_waiters: usize,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem::link;
    use crate::transport::Inbound;
    use crosslink_core::config::CrosslinkConfig;
    use crosslink_core::message::FastReply;
    use crosslink_core::types::{ExecutionContext, SystemTimeSource, TabId};
    use serde_json::json;

    fn channel_for(
        endpoint: &crate::transport::mem::MemEndpoint,
        config: &CrosslinkConfig,
    ) -> TransportChannel {
        TransportChannel::new(
            endpoint.transport(),
            config.delivery.clone(),
            config.breaker.clone(),
            Arc::new(SystemTimeSource),
        )
    }

    fn ping(id: &str) -> WireMessage {
        WireMessage::request("status.ping", RequestId::new(id), json!({}), None)
    }

    #[tokio::test]
    async fn test_fast_completion() {
        let config = CrosslinkConfig::testing();
        let (client, mut server) = link(
            ExecutionContext::content_script(TabId::new(1)),
            ExecutionContext::Background,
        );
        let mut inbound = server.take_inbound().unwrap();
        tokio::spawn(async move {
            while let Some(Inbound::Request { reply, .. }) = inbound.recv().await {
                let _ = reply.send(FastReply::completed(json!({"ok": true})));
            }
        });

        let channel = channel_for(&client, &config);
        let outcome = channel
            .request(ping("r1"), SenderInfo::unknown(), true)
            .await
            .unwrap();
        assert_eq!(outcome, ChannelOutcome::Completed(json!({"ok": true})));
        assert_eq!(channel.stats().fast_completed, 1);
    }

    #[tokio::test]
    async fn test_ack_then_durable_result() {
        let config = CrosslinkConfig::testing();
        let (mut client, mut server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        let mut server_inbound = server.take_inbound().unwrap();
        let back = server.transport();
        tokio::spawn(async move {
            if let Some(Inbound::Request { message, reply, .. }) = server_inbound.recv().await {
                let id = message.message_id().clone();
                let _ = reply.send(FastReply::accepted());
                let _ = back
                    .send(WireMessage::result_ok(id, json!({"late": true})))
                    .await;
            }
        });

        let channel = Arc::new(channel_for(&client, &config));
        let id = RequestId::new("r1");
        let rx = channel.register_waiter(&id);
        let outcome = channel
            .request(ping("r1"), SenderInfo::unknown(), true)
            .await
            .unwrap();
        assert_eq!(outcome, ChannelOutcome::Accepted { streaming: false });

        // Pump the client's inbound side by hand
        let mut client_inbound = client.take_inbound().unwrap();
        if let Some(Inbound::Notice { message }) = client_inbound.recv().await {
            assert!(channel.resolve_inbound(&message));
        } else {
            panic!("expected durable result notice");
        }
        assert_eq!(rx.await.unwrap(), Ok(json!({"late": true})));
    }

    #[tokio::test]
    async fn test_unanswered_exchange_falls_back_to_durable_resend() {
        let config = CrosslinkConfig::testing();
        let (client, mut server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        let mut server_inbound = server.take_inbound().unwrap();
        // Nobody answers the fast exchange; every request hangs
        client.faults().drop_next_requests(10);

        let channel = channel_for(&client, &config);
        let outcome = channel
            .request(ping("r1"), SenderInfo::unknown(), true)
            .await
            .unwrap();
        assert_eq!(outcome, ChannelOutcome::Resent);
        assert_eq!(channel.stats().durable_fallbacks, 1);

        // The resend reaches the destination as a one-way notice
        match server_inbound.recv().await {
            Some(Inbound::Notice {
                message: WireMessage::Request { message_id, .. },
            }) => assert_eq!(message_id.as_str(), "r1"),
            other => panic!("expected resent request notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_surfaces_transport_error() {
        let config = CrosslinkConfig::testing();
        let (client, _server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        client.faults().close();

        let channel = channel_for(&client, &config);
        let err = channel
            .request(ping("r1"), SenderInfo::unknown(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CrosslinkError::Transport(TransportError::ChannelClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let config = CrosslinkConfig::testing();
        let (client, _server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        client.faults().close();
        let channel = channel_for(&client, &config);

        // Threshold is four consecutive failed exchanges
        for i in 0..4 {
            let err = channel
                .request(ping(&format!("r{i}")), SenderInfo::unknown(), false)
                .await
                .unwrap_err();
            assert!(err.is_retryable(), "attempt {i} should be transport error");
        }

        let err = channel
            .request(ping("r9"), SenderInfo::unknown(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CrosslinkError::CircuitOpen { .. }));
        assert_eq!(channel.stats().rejected_by_breaker, 1);
    }

    #[tokio::test]
    async fn test_destination_failure_spares_breaker() {
        let config = CrosslinkConfig::testing();
        let (client, mut server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        let mut inbound = server.take_inbound().unwrap();
        tokio::spawn(async move {
            while let Some(Inbound::Request { reply, .. }) = inbound.recv().await {
                let _ = reply.send(FastReply::failed(ErrorInfo::new("quota", "provider")));
            }
        });

        let channel = channel_for(&client, &config);
        for i in 0..6 {
            let err = channel
                .request(ping(&format!("r{i}")), SenderInfo::unknown(), true)
                .await
                .unwrap_err();
            assert!(matches!(err, CrosslinkError::Destination { .. }));
        }
        // Destination said no six times; the channel itself stayed healthy
        assert_eq!(channel.stats().rejected_by_breaker, 0);
    }

    #[tokio::test]
    async fn test_context_invalidation_aborts_without_breaker_penalty() {
        let config = CrosslinkConfig::testing();
        let (client, _server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        client.faults().invalidate();
        let channel = channel_for(&client, &config);

        for i in 0..6 {
            let err = channel
                .request(ping(&format!("r{i}")), SenderInfo::unknown(), true)
                .await
                .unwrap_err();
            assert!(err.is_context_invalidated());
        }
        let snapshot = channel.breaker_snapshot().unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unclaimed_result_is_kept() {
        let config = CrosslinkConfig::testing();
        let (client, _server) = link(
            ExecutionContext::Popup,
            ExecutionContext::Background,
        );
        let channel = channel_for(&client, &config);
        let id = RequestId::new("late-1");

        let consumed = channel.resolve_inbound(&WireMessage::result_ok(
            id.clone(),
            json!({"v": 1}),
        ));
        assert!(!consumed);
        assert_eq!(channel.take_unclaimed(&id), Some(Ok(json!({"v": 1}))));
        assert_eq!(channel.take_unclaimed(&id), None);
    }
}
