//! Result dispatch back to origin contexts
//!
//! A finished operation is finalized exactly once; everything after that is
//! delivery mechanics. Results for unavailable contexts (popup closed, tab
//! navigating) are queued and re-offered by the flush timer until they age
//! out; oversized results are broadcast instead of targeted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crosslink_core::tracker::CompletionRecord;
use crosslink_core::config::DispatcherConfig;
use crosslink_core::types::{CorrelationId, ExecutionContext, RequestId, TimeSource, Timestamp};
use crosslink_core::Result;

use crate::channel::DurableOutcome;

// ----------------------------------------------------------------------------
// Result Sink
// ----------------------------------------------------------------------------

/// A finalized result on its way to an origin context
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDelivery {
    pub id: RequestId,
    pub action: String,
    pub correlation_id: Option<CorrelationId>,
    pub outcome: DurableOutcome,
    pub completed_at: Timestamp,
}

/// Where finalized results go. The runtime wires a transport-backed sink;
/// tests use a recording one.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Whether the context can receive right now
    fn is_available(&self, context: &ExecutionContext) -> bool;

    /// Deliver to one context
    async fn deliver(&self, context: &ExecutionContext, delivery: &ResultDelivery) -> Result<()>;

    /// Offer to every listening context
    async fn broadcast(&self, delivery: &ResultDelivery) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Dispatch Outcomes
// ----------------------------------------------------------------------------

/// What the dispatcher did with a finalized result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the origin context
    Delivered,
    /// Too large for targeted delivery; broadcast instead
    Broadcast,
    /// Origin unavailable; queued for the flush timer
    Queued,
    /// This id was already finalized; nothing happened
    Duplicate,
}

/// Counts from one flush pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub requeued: usize,
    pub expired: usize,
    pub exhausted: usize,
}

#[derive(Debug)]
struct QueuedDelivery {
    target: ExecutionContext,
    delivery: ResultDelivery,
    queued_at: Timestamp,
    attempts: u32,
}

// ----------------------------------------------------------------------------
// Result Dispatcher
// ----------------------------------------------------------------------------

/// Finalizes results once and sees them delivered
pub struct ResultDispatcher {
    config: DispatcherConfig,
    sink: Arc<dyn ResultSink>,
    time_source: Arc<dyn TimeSource>,
    /// Ids finalized already, with finalization time for eventual cleanup
    finalized: Mutex<HashMap<RequestId, Timestamp>>,
    queue: Mutex<VecDeque<QueuedDelivery>>,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    /// Queued results dropped past `queue_max_age`
    expired: AtomicU64,
    /// Deliveries abandoned after `max_delivery_attempts`; the computation
    /// succeeded but the dispatcher counts the operation as failed
    exhausted: AtomicU64,
}

impl ResultDispatcher {
    pub fn new(
        config: DispatcherConfig,
        sink: Arc<dyn ResultSink>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            sink,
            time_source,
            finalized: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Finalize and deliver one completed operation.
    ///
    /// Finalization is idempotent: the first call for an id wins, any later
    /// call is a no-op regardless of which path (result, timeout, stream
    /// end) produced it.
    pub async fn dispatch(
        &self,
        record: CompletionRecord,
        outcome: DurableOutcome,
    ) -> Result<DispatchOutcome> {
        let now = self.time_source.now();
        if !self.try_finalize(&record.id, now) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(id = %record.id, "ignoring duplicate finalization");
            return Ok(DispatchOutcome::Duplicate);
        }

        let delivery = ResultDelivery {
            id: record.id,
            action: record.action,
            correlation_id: record.correlation_id,
            outcome,
            completed_at: record.completed_at,
        };

        if self.is_large(&delivery) {
            info!(id = %delivery.id, "broadcasting oversized result");
            self.sink.broadcast(&delivery).await?;
            self.delivered.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::Broadcast);
        }

        if !self.sink.is_available(&record.origin) {
            debug!(id = %delivery.id, origin = %record.origin, "origin unavailable, queueing result");
            self.enqueue(record.origin, delivery, now, 0);
            return Ok(DispatchOutcome::Queued);
        }

        match self.deliver_with_retries(&record.origin, &delivery).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(DispatchOutcome::Delivered)
            }
            Err(err) => {
                warn!(id = %delivery.id, error = %err, "delivery failed, queueing for flush");
                self.enqueue(record.origin, delivery, now, self.config.max_delivery_attempts);
                Ok(DispatchOutcome::Queued)
            }
        }
    }

    /// Re-offer queued results. Called by the flush timer and on context
    /// reattachment.
    pub async fn flush(&self) -> FlushReport {
        let now = self.time_source.now();
        let pending: Vec<QueuedDelivery> = match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return FlushReport::default(),
        };

        let mut report = FlushReport::default();
        for mut entry in pending {
            if now.duration_since(entry.queued_at) > self.config.queue_max_age {
                debug!(id = %entry.delivery.id, "dropping queued result past max age");
                self.expired.fetch_add(1, Ordering::Relaxed);
                report.expired += 1;
                continue;
            }
            if !self.sink.is_available(&entry.target) {
                self.requeue(entry);
                report.requeued += 1;
                continue;
            }
            entry.attempts += 1;
            match self.sink.deliver(&entry.target, &entry.delivery).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(err) if entry.attempts >= self.config.max_delivery_attempts => {
                    warn!(id = %entry.delivery.id, error = %err, "giving up on queued result");
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                    report.exhausted += 1;
                }
                Err(_) => {
                    self.requeue(entry);
                    report.requeued += 1;
                }
            }
        }
        report
    }

    /// Whether an id has been finalized
    pub fn is_finalized(&self, id: &RequestId) -> bool {
        self.finalized
            .lock()
            .map(|f| f.contains_key(id))
            .unwrap_or(false)
    }

    /// Drop finalization markers older than `retention`
    pub fn sweep_finalized(&self, retention: Duration) -> usize {
        let now = self.time_source.now();
        let Ok(mut finalized) = self.finalized.lock() else {
            return 0;
        };
        let before = finalized.len();
        finalized.retain(|_, at| now.duration_since(*at) <= retention);
        before - finalized.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            queued: self.queue.lock().map(|q| q.len()).unwrap_or(0),
            finalized: self.finalized.lock().map(|f| f.len()).unwrap_or(0),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn try_finalize(&self, id: &RequestId, now: Timestamp) -> bool {
        match self.finalized.lock() {
            Ok(mut finalized) => {
                if finalized.contains_key(id) {
                    false
                } else {
                    finalized.insert(id.clone(), now);
                    true
                }
            }
            Err(_) => false,
        }
    }

    fn is_large(&self, delivery: &ResultDelivery) -> bool {
        let payload = match &delivery.outcome {
            Ok(value) => value,
            Err(_) => return false,
        };
        serde_json::to_string(payload)
            .map(|s| s.len() >= self.config.large_result_threshold)
            .unwrap_or(false)
    }

    async fn deliver_with_retries(
        &self,
        target: &ExecutionContext,
        delivery: &ResultDelivery,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..self.config.max_delivery_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.delivery_backoff_step * attempt).await;
            }
            match self.sink.deliver(target, delivery).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            crosslink_core::CrosslinkError::channel_error("delivery failed without error")
        }))
    }

    fn enqueue(
        &self,
        target: ExecutionContext,
        delivery: ResultDelivery,
        now: Timestamp,
        attempts: u32,
    ) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(QueuedDelivery {
                target,
                delivery,
                queued_at: now,
                attempts,
            });
        }
    }

    fn requeue(&self, entry: QueuedDelivery) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(entry);
        }
    }
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub delivered: u64,
    pub duplicates: u64,
    /// Queued results that aged out undelivered
    pub expired: u64,
    /// Operations whose computed result never reached any destination
    pub exhausted: u64,
    pub queued: usize,
    pub finalized: usize,
}

// ----------------------------------------------------------------------------
// Recording Sink (test support)
// ----------------------------------------------------------------------------

/// In-memory sink recording deliveries, with availability toggles
pub struct RecordingSink {
    deliveries: Mutex<Vec<(ExecutionContext, ResultDelivery)>>,
    broadcasts: Mutex<Vec<ResultDelivery>>,
    unavailable: Mutex<Vec<ExecutionContext>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            unavailable: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unavailable(&self, context: ExecutionContext) {
        if let Ok(mut unavailable) = self.unavailable.lock() {
            unavailable.push(context);
        }
    }

    pub fn set_available(&self, context: &ExecutionContext) {
        if let Ok(mut unavailable) = self.unavailable.lock() {
            unavailable.retain(|c| c != context);
        }
    }

    pub fn deliveries(&self) -> Vec<(ExecutionContext, ResultDelivery)> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn broadcasts(&self) -> Vec<ResultDelivery> {
        self.broadcasts.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    fn is_available(&self, context: &ExecutionContext) -> bool {
        self.unavailable
            .lock()
            .map(|u| !u.contains(context))
            .unwrap_or(true)
    }

    async fn deliver(&self, context: &ExecutionContext, delivery: &ResultDelivery) -> Result<()> {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push((context.clone(), delivery.clone()));
        }
        Ok(())
    }

    async fn broadcast(&self, delivery: &ResultDelivery) -> Result<()> {
        if let Ok(mut broadcasts) = self.broadcasts.lock() {
            broadcasts.push(delivery.clone());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crosslink_core::types::{ManualTimeSource, SystemTimeSource, TabId};
    use serde_json::json;

    fn record(id: &str, origin: ExecutionContext) -> CompletionRecord {
        CompletionRecord {
            id: RequestId::new(id),
            action: "translate.text".into(),
            origin,
            correlation_id: None,
            completed_at: Timestamp::new(0),
        }
    }

    fn dispatcher_with(sink: Arc<RecordingSink>) -> ResultDispatcher {
        ResultDispatcher::new(
            crosslink_core::config::CrosslinkConfig::testing().dispatcher,
            sink,
            Arc::new(SystemTimeSource),
        )
    }

    #[tokio::test]
    async fn test_delivery_to_available_origin() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = dispatcher_with(Arc::clone(&sink));
        let origin = ExecutionContext::content_script(TabId::new(1));

        let outcome = dispatcher
            .dispatch(record("r1", origin.clone()), Ok(json!({"v": 1})))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert_eq!(sink.deliveries().len(), 1);
        assert_eq!(sink.deliveries()[0].0, origin);
    }

    #[tokio::test]
    async fn test_finalization_is_idempotent() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = dispatcher_with(Arc::clone(&sink));
        let origin = ExecutionContext::Popup;

        let first = dispatcher
            .dispatch(record("r1", origin.clone()), Ok(json!({"v": 1})))
            .await
            .unwrap();
        // Same id finalized again through a different path (late result
        // after timeout)
        let second = dispatcher
            .dispatch(record("r1", origin), Ok(json!({"v": 2})))
            .await
            .unwrap();

        assert_eq!(first, DispatchOutcome::Delivered);
        assert_eq!(second, DispatchOutcome::Duplicate);
        assert_eq!(sink.deliveries().len(), 1);
        assert_eq!(dispatcher.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_unavailable_origin_queues_then_flushes() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = dispatcher_with(Arc::clone(&sink));
        let origin = ExecutionContext::Popup;
        sink.set_unavailable(origin.clone());

        let outcome = dispatcher
            .dispatch(record("r1", origin.clone()), Ok(json!({"v": 1})))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert!(sink.deliveries().is_empty());

        // Popup reopens
        sink.set_available(&origin);
        let report = dispatcher.flush().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_result_expires() {
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualTimeSource::starting_at(0));
        let config = crosslink_core::config::CrosslinkConfig::testing().dispatcher;
        let max_age = config.queue_max_age;
        let dispatcher = ResultDispatcher::new(config, Arc::clone(&sink) as _, Arc::clone(&clock) as _);
        let origin = ExecutionContext::Popup;
        sink.set_unavailable(origin.clone());

        dispatcher
            .dispatch(record("r1", origin), Ok(json!({"v": 1})))
            .await
            .unwrap();

        clock.advance(max_age.as_millis() as u64 + 1);
        let report = dispatcher.flush().await;
        assert_eq!(report.expired, 1);
        assert!(sink.deliveries().is_empty());

        // The drop stays visible after the per-call report is gone
        assert_eq!(dispatcher.stats().expired, 1);
        assert_eq!(dispatcher.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_large_result_broadcasts() {
        let sink = Arc::new(RecordingSink::new());
        let mut config = crosslink_core::config::CrosslinkConfig::testing().dispatcher;
        config.large_result_threshold = 64;
        let dispatcher =
            ResultDispatcher::new(config, Arc::clone(&sink) as _, Arc::new(SystemTimeSource));

        let big = json!({ "text": "x".repeat(200) });
        let outcome = dispatcher
            .dispatch(record("r1", ExecutionContext::Popup), Ok(big))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Broadcast);
        assert_eq!(sink.broadcasts().len(), 1);
        assert!(sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_finalized() {
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualTimeSource::starting_at(0));
        let dispatcher = ResultDispatcher::new(
            crosslink_core::config::CrosslinkConfig::testing().dispatcher,
            Arc::clone(&sink) as _,
            Arc::clone(&clock) as _,
        );

        dispatcher
            .dispatch(record("r1", ExecutionContext::Popup), Ok(json!(1)))
            .await
            .unwrap();
        assert!(dispatcher.is_finalized(&RequestId::new("r1")));

        clock.advance(10_000);
        assert_eq!(dispatcher.sweep_finalized(Duration::from_secs(5)), 1);
        assert!(!dispatcher.is_finalized(&RequestId::new("r1")));
    }
}
