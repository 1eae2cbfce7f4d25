//! Request coordination
//!
//! The Coordinator owns the full lifecycle on both sides of a channel. On
//! the sending side it admits requests, runs the fast exchange, awaits
//! durable results and keeps late completions flowing to the dispatcher.
//! On the receiving side it deduplicates incoming ids, routes them to
//! registered handlers and produces the fast replies.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crosslink_core::config::CrosslinkConfig;
use crosslink_core::errors::{CrosslinkError, TransportError};
use crosslink_core::message::{ErrorInfo, FastReply, FastReplyKind, WireMessage};
use crosslink_core::router::{HandlerOutcome, MessageRouter, SenderInfo};
use crosslink_core::timeouts::{is_streaming_payload, timeout_for_action, StreamingTimeouts};
use crosslink_core::tracker::{
    AdmitOutcome, CompletionRecord, OperationRequest, RequestStatus, RequestTracker, SweepReport,
    TrackerStats,
};
use crosslink_core::types::{ExecutionContext, RequestId, TabId, TimeSource};
use crosslink_core::Result;

use crate::channel::{ChannelOutcome, DurableOutcome, TransportChannel};
use crate::dispatcher::ResultDispatcher;
use crate::streaming::{StreamEvent, StreamingResponseHandler, StreamingTimeoutManager};
use crate::transport::Inbound;

// ----------------------------------------------------------------------------
// Submission Outcomes
// ----------------------------------------------------------------------------

/// What a successful submission produced
#[derive(Debug)]
pub enum Submission {
    /// Final value in hand
    Completed(Value),
    /// Destination chose to stream; consume events until `End`
    Streaming(mpsc::UnboundedReceiver<StreamEvent>),
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Orchestrates request lifecycles over one transport channel
pub struct Coordinator {
    config: CrosslinkConfig,
    local_context: ExecutionContext,
    time_source: Arc<dyn TimeSource>,
    // Guard is never held across an await point
    tracker: Mutex<RequestTracker>,
    channel: Arc<TransportChannel>,
    streaming: Arc<StreamingResponseHandler>,
    stream_timeouts: Arc<StreamingTimeoutManager>,
    dispatcher: Arc<ResultDispatcher>,
    router: RwLock<MessageRouter>,
}

impl Coordinator {
    pub fn new(
        config: CrosslinkConfig,
        local_context: ExecutionContext,
        channel: Arc<TransportChannel>,
        dispatcher: Arc<ResultDispatcher>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let tracker = RequestTracker::new(config.tracker.clone());
        let streaming = Arc::new(StreamingResponseHandler::new(config.streaming.clone()));
        let stream_timeouts = Arc::new(StreamingTimeoutManager::new(
            config.streaming.hard_ceiling,
            Arc::clone(&time_source),
        ));
        Self {
            config,
            local_context,
            time_source,
            tracker: Mutex::new(tracker),
            channel,
            streaming,
            stream_timeouts,
            dispatcher,
            router: RwLock::new(MessageRouter::new()),
        }
    }

    /// Register a handler for incoming requests with the given action
    pub fn register_handler<A, F>(&self, action: A, handler: F)
    where
        A: Into<String>,
        F: Fn(Value, SenderInfo) -> futures::future::BoxFuture<'static, Result<HandlerOutcome>>
            + Send
            + Sync
            + 'static,
    {
        if let Ok(mut router) = self.router.write() {
            router.register(action, handler);
        }
    }

    // ------------------------------------------------------------------
    // Sending side
    // ------------------------------------------------------------------

    /// Submit an operation and drive it to an outcome.
    ///
    /// Admission deduplicates by id; payload shape picks the streaming or
    /// regular path up front. The fast exchange resolves synchronous
    /// completions immediately and may override the chosen path (a
    /// synchronous result downgrades to regular, a streaming ACK upgrades).
    /// A missed result deadline resolves this call with a timeout error
    /// while a detached wait keeps the late result eligible for best-effort
    /// delivery through the dispatcher.
    pub async fn submit(&self, request: OperationRequest) -> Result<Submission> {
        let id = request.id.clone();
        let action = request.action.clone();
        let payload = request.payload.clone();
        let origin = request.origin.clone();
        let correlation_id = request.correlation_id.clone();
        let idempotent = request.idempotent;

        match self.with_tracker(|t| t.admit(request, self.time_source.now()))? {
            AdmitOutcome::Admitted => {}
            AdmitOutcome::CachedResult(value) => return Ok(Submission::Completed(value)),
            AdmitOutcome::CachedFailure(error) => return Err(CrosslinkError::from(error)),
        }

        // Heavy payloads take the streaming path; windows are registered
        // before the send so early updates already count as progress.
        let expect_streaming = is_streaming_payload(&payload, &self.config.streaming);
        if expect_streaming {
            let windows = StreamingTimeouts::for_payload(&payload, &self.config.streaming);
            self.stream_timeouts.register(id.clone(), windows);
        }

        let message = WireMessage::request(
            action.clone(),
            id.clone(),
            payload.clone(),
            Some(self.local_context.clone()),
        );
        let sender = SenderInfo::new(Some(self.local_context.clone()));

        let outcome = match self.channel.request(message, sender, idempotent).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.stream_timeouts.unregister(&id);
                self.with_tracker(|t| {
                    t.fail(&id, err.to_error_info(), self.time_source.now())
                })?;
                return Err(err);
            }
        };

        match outcome {
            ChannelOutcome::Completed(value) => {
                // Synchronous completion: nothing left to track or replay
                self.stream_timeouts.unregister(&id);
                self.with_tracker(|t| Ok(t.remove(&id)))?;
                Ok(Submission::Completed(value))
            }
            ChannelOutcome::Accepted { streaming: true } => {
                self.mark_live(&id, true)?;
                if !expect_streaming {
                    let windows =
                        StreamingTimeouts::for_payload(&payload, &self.config.streaming);
                    self.stream_timeouts.register(id.clone(), windows);
                }
                Ok(Submission::Streaming(self.streaming.subscribe(&id)))
            }
            ChannelOutcome::Accepted { streaming: false } | ChannelOutcome::Resent
                if expect_streaming =>
            {
                self.mark_live(&id, true)?;
                Ok(Submission::Streaming(self.streaming.subscribe(&id)))
            }
            ChannelOutcome::Accepted { streaming: false } | ChannelOutcome::Resent => {
                self.mark_live(&id, false)?;
                self.await_durable(id, action, origin, correlation_id).await
            }
        }
    }

    /// Move an admitted entry to its in-flight status. The outcome can land
    /// before the fast exchange resolves; an entry that already went
    /// terminal is left alone, the buffered events carry the result.
    fn mark_live(&self, id: &RequestId, streaming: bool) -> Result<()> {
        let result = self.with_tracker(|t| {
            if streaming {
                t.mark_streaming(id)
            } else {
                t.mark_processing(id)
            }
        });
        match result {
            Ok(())
            | Err(CrosslinkError::InvalidTransition { .. })
            | Err(CrosslinkError::AlreadyTerminal { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn await_durable(
        &self,
        id: RequestId,
        action: String,
        origin: ExecutionContext,
        correlation_id: Option<crosslink_core::types::CorrelationId>,
    ) -> Result<Submission> {
        let timeout = timeout_for_action(&action, &self.config.timeouts);
        match self.channel.await_result(&id, timeout).await {
            Ok(value) => {
                self.with_tracker(|t| t.complete(&id, value.clone(), self.time_source.now()))?;
                Ok(Submission::Completed(value))
            }
            Err(err @ CrosslinkError::Transport(TransportError::ResultTimeout { .. })) => {
                // Soft timeout: the operation may still finish out there.
                // A request already cancelled underneath us stays cancelled.
                let marked = self
                    .with_tracker(|t| t.mark_timed_out(&id, self.time_source.now()))
                    .is_ok();
                if marked {
                    self.spawn_late_result_watch(id, action, origin, correlation_id);
                }
                Err(err)
            }
            Err(err) => {
                let _ = self.with_tracker(|t| {
                    t.fail(&id, err.to_error_info(), self.time_source.now())
                });
                Err(err)
            }
        }
    }

    /// Keep a detached waiter alive so a result arriving after the caller
    /// gave up still reaches the origin context through the dispatcher.
    fn spawn_late_result_watch(
        &self,
        id: RequestId,
        action: String,
        origin: ExecutionContext,
        correlation_id: Option<crosslink_core::types::CorrelationId>,
    ) {
        let channel = Arc::clone(&self.channel);
        let dispatcher = Arc::clone(&self.dispatcher);
        let time_source = Arc::clone(&self.time_source);
        let ceiling = self.config.delivery.late_result_ceiling;
        tokio::spawn(async move {
            let outcome: DurableOutcome = match channel.await_result(&id, ceiling).await {
                Ok(value) => Ok(value),
                Err(CrosslinkError::Transport(TransportError::ResultTimeout { .. })) => {
                    debug!(id = %id, "late result never arrived");
                    return;
                }
                Err(err) => Err(err.to_error_info()),
            };
            info!(id = %id, "delivering late result");
            let record = CompletionRecord {
                id: id.clone(),
                action,
                origin,
                correlation_id,
                completed_at: time_source.now(),
            };
            if let Err(err) = dispatcher.dispatch(record, outcome).await {
                warn!(id = %id, error = %err, "late result dispatch failed");
            }
        });
    }

    /// Cancel one in-flight request. Returns whether a live request was
    /// actually cancelled; an unknown id is a no-op, not an error. The
    /// remote side is notified best-effort so it can stop working.
    pub fn cancel(&self, id: &RequestId, reason: &str) -> Result<bool> {
        match self.with_tracker(|t| t.cancel(id, reason, self.time_source.now())) {
            Ok(()) => {}
            Err(CrosslinkError::UnknownRequest { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        self.channel.forget_waiter(id);
        self.streaming.forget(id);
        self.stream_timeouts.unregister(id);

        let channel = Arc::clone(&self.channel);
        let notice = WireMessage::Error {
            message_id: id.clone(),
            error: ErrorInfo::new(reason, "cancelled"),
        };
        tokio::spawn(async move {
            if let Err(err) = channel.send(notice).await {
                debug!(error = %err, "cancel notice not delivered");
            }
        });
        debug!(id = %id, reason, "request cancelled");
        Ok(true)
    }

    /// Apply a peer's cancel notice to a locally-executing request
    fn cancel_from_notice(&self, id: &RequestId, reason: &str) {
        match self.with_tracker(|t| t.cancel(id, reason, self.time_source.now())) {
            Ok(()) => {
                self.streaming.forget(id);
                self.stream_timeouts.unregister(id);
                debug!(id = %id, reason, "cancelled by origin");
            }
            Err(err) => debug!(id = %id, error = %err, "cancel notice had nothing to cancel"),
        }
    }

    /// Cancel every in-flight request that originated from a tab (used on
    /// navigation and tab close)
    pub fn cancel_for_tab(&self, tab_id: TabId, reason: &str) -> usize {
        let ids = self
            .tracker
            .lock()
            .map(|t| t.requests_for_tab(tab_id))
            .unwrap_or_default();
        let mut cancelled = 0;
        for id in ids {
            if matches!(self.cancel(&id, reason), Ok(true)) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(tab = tab_id.value(), cancelled, reason, "cancelled requests for tab");
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Receiving side
    // ------------------------------------------------------------------

    /// Handle one inbound envelope from the transport
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Request {
                message,
                sender,
                reply,
            } => {
                let fast_reply = self.handle_incoming_request(message, sender).await;
                let _ = reply.send(fast_reply);
            }
            Inbound::Notice { message } => self.handle_notice(message).await,
        }
    }

    async fn handle_incoming_request(
        &self,
        message: WireMessage,
        sender: SenderInfo,
    ) -> FastReply {
        if let Err(err) = message.validate() {
            return FastReply::failed(err.to_error_info());
        }
        let WireMessage::Request {
            action,
            message_id,
            data,
            context,
        } = message
        else {
            return FastReply::failed(ErrorInfo::new("not a request", "invalid_message"));
        };

        let origin = sender
            .context
            .clone()
            .or(context)
            .unwrap_or(ExecutionContext::Background);
        let request = OperationRequest::new(
            message_id.clone(),
            action.clone(),
            data.clone(),
            origin.clone(),
        );
        let sender = SenderInfo::for_request(Some(origin), message_id.clone());

        let admit = self.with_tracker(|t| t.admit(request, self.time_source.now()));
        match admit {
            Ok(AdmitOutcome::Admitted) => {}
            Ok(AdmitOutcome::CachedResult(value)) => return FastReply::completed(value),
            Ok(AdmitOutcome::CachedFailure(error)) => return FastReply::failed(error),
            Err(CrosslinkError::StillProcessing { .. }) => {
                // Wire-level duplicate of a live operation: ACK again, the
                // original run will produce the result
                return FastReply::accepted();
            }
            Err(err) => return FastReply::failed(err.to_error_info()),
        }

        let handler_future = match self.router.read() {
            Ok(router) => router.dispatch(&action, data, sender),
            Err(_) => None,
        };
        let Some(future) = handler_future else {
            warn!(action = %action, "no handler registered");
            let error = ErrorInfo::new(format!("no handler for action {action}"), "unknown_action");
            let _ = self.with_tracker(|t| {
                t.fail(&message_id, error.clone(), self.time_source.now())
            });
            return FastReply::failed(error);
        };

        match future.await {
            Ok(HandlerOutcome::Reply(value)) => {
                let _ = self.with_tracker(|t| {
                    t.complete(&message_id, value.clone(), self.time_source.now())
                });
                FastReply::completed(value)
            }
            Ok(HandlerOutcome::WillRespondLater) => {
                let _ = self.with_tracker(|t| t.mark_processing(&message_id));
                FastReply::accepted()
            }
            Ok(HandlerOutcome::Streaming) => {
                let _ = self.with_tracker(|t| t.mark_streaming(&message_id));
                FastReply::streaming_started()
            }
            Err(err) => {
                let error = err.to_error_info();
                let _ = self.with_tracker(|t| {
                    t.fail(&message_id, error.clone(), self.time_source.now())
                });
                FastReply::failed(error)
            }
        }
    }

    async fn handle_notice(&self, message: WireMessage) {
        match &message {
            WireMessage::StreamUpdate { message_id, .. } => {
                self.stream_timeouts.notify_progress(message_id);
                self.streaming.on_message(&message, self.time_source.now());
            }
            WireMessage::StreamEnd {
                message_id,
                success,
                data,
                error,
            } => {
                let outcome: DurableOutcome = if *success {
                    Ok(data.clone().unwrap_or(Value::Null))
                } else {
                    Err(error
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::new("stream failed", "destination")))
                };
                self.finish_stream(message_id.clone(), message.clone(), outcome)
                    .await;
            }
            WireMessage::Result {
                message_id,
                success,
                data,
                error,
            } => {
                let outcome: DurableOutcome = if *success {
                    Ok(data.clone().unwrap_or(Value::Null))
                } else {
                    Err(error
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::new("unspecified failure", "destination")))
                };
                self.resolve_terminal(message_id.clone(), &message, outcome)
                    .await;
            }
            WireMessage::Error { message_id, error } => {
                // A cancel notice targets work hosted here, never an
                // outcome someone local is awaiting
                if error.kind == "cancelled" && !self.channel.has_waiter(message_id) {
                    self.cancel_from_notice(message_id, &error.message);
                    return;
                }
                self.resolve_terminal(message_id.clone(), &message, Err(error.clone()))
                    .await;
            }
            WireMessage::Request { .. } => {
                // A fast exchange the sender gave up on, resent one-way. The
                // tracker dedups reruns; the reply goes back durably.
                let id = message.message_id().clone();
                let reply = self
                    .handle_incoming_request(message.clone(), SenderInfo::new(None))
                    .await;
                let durable_reply = match reply.classify() {
                    FastReplyKind::Completed(value) => {
                        Some(WireMessage::result_ok(id.clone(), value))
                    }
                    FastReplyKind::Failed(error) => {
                        Some(WireMessage::result_err(id.clone(), error))
                    }
                    // Accepted: the handler will produce the result itself
                    FastReplyKind::Accepted { .. } => None,
                };
                if let Some(reply_message) = durable_reply {
                    if let Err(err) = self.channel.send(reply_message).await {
                        warn!(id = %id, error = %err, "durable reply send failed");
                    }
                }
            }
            WireMessage::Ack { .. } => {
                debug!("ignoring unexpected notice kind");
            }
        }
    }

    /// Resolve a terminal RESULT/ERROR for `id`. A plain result for a
    /// streaming operation terminates the stream exactly like a stream end.
    async fn resolve_terminal(&self, id: RequestId, message: &WireMessage, outcome: DurableOutcome) {
        if self.request_status(&id) == Some(RequestStatus::Streaming) {
            let end = match &outcome {
                Ok(value) => WireMessage::StreamEnd {
                    message_id: id.clone(),
                    success: true,
                    data: Some(value.clone()),
                    error: None,
                },
                Err(error) => WireMessage::StreamEnd {
                    message_id: id.clone(),
                    success: false,
                    data: None,
                    error: Some(error.clone()),
                },
            };
            self.finish_stream(id, end, outcome).await;
            return;
        }
        let consumed = self.channel.resolve_inbound(message);
        if !consumed {
            self.deliver_unclaimed(id).await;
        }
    }

    async fn finish_stream(&self, id: RequestId, message: WireMessage, outcome: DurableOutcome) {
        self.stream_timeouts.unregister(&id);
        let status = self.tracker.lock().ok().and_then(|t| t.status(&id));
        match status {
            Some(RequestStatus::Streaming) | Some(RequestStatus::Processing)
            | Some(RequestStatus::Pending) => {
                let now = self.time_source.now();
                let _ = self.with_tracker(|t| match &outcome {
                    Ok(value) => t.complete(&id, value.clone(), now),
                    Err(error) => t.fail(&id, error.clone(), now),
                });
                self.streaming.on_message(&message, now);
            }
            Some(RequestStatus::TimedOut) => {
                // The caller already gave up; best-effort late delivery
                self.deliver_late(&id, outcome).await;
            }
            _ => {
                self.streaming.on_message(&message, self.time_source.now());
            }
        }
    }

    /// Route a result that found no waiter: if the operation soft-timed out
    /// earlier, hand the late outcome to the dispatcher.
    async fn deliver_unclaimed(&self, id: RequestId) {
        let status = self.tracker.lock().ok().and_then(|t| t.status(&id));
        if status == Some(RequestStatus::TimedOut) {
            if let Some(outcome) = self.channel.take_unclaimed(&id) {
                self.deliver_late(&id, outcome).await;
            }
        }
    }

    async fn deliver_late(&self, id: &RequestId, outcome: DurableOutcome) {
        let record = match self.tracker.lock() {
            Ok(tracker) => tracker.get(id).map(|entry| CompletionRecord {
                id: entry.id.clone(),
                action: entry.action.clone(),
                origin: entry.origin.clone(),
                correlation_id: entry.correlation_id.clone(),
                completed_at: self.time_source.now(),
            }),
            Err(_) => None,
        };
        let Some(record) = record else {
            debug!(id = %id, "late outcome for unknown request, dropping");
            return;
        };
        info!(id = %id, "delivering late outcome");
        if let Err(err) = self.dispatcher.dispatch(record, outcome).await {
            warn!(id = %id, error = %err, "late dispatch failed");
        }
    }

    /// Produce the durable result for a request accepted earlier with
    /// `WillRespondLater`
    pub async fn complete_request(&self, id: &RequestId, outcome: DurableOutcome) -> Result<()> {
        let now = self.time_source.now();
        let message = match &outcome {
            Ok(value) => {
                self.with_tracker(|t| t.complete(id, value.clone(), now))?;
                WireMessage::result_ok(id.clone(), value.clone())
            }
            Err(error) => {
                self.with_tracker(|t| t.fail(id, error.clone(), now))?;
                WireMessage::result_err(id.clone(), error.clone())
            }
        };
        self.channel.send(message).await
    }

    /// Emit a stream update for a request accepted with `Streaming`
    pub async fn stream_update(&self, id: &RequestId, seq: u64, data: Value) -> Result<()> {
        self.channel
            .send(WireMessage::StreamUpdate {
                message_id: id.clone(),
                seq,
                data,
            })
            .await
    }

    /// Terminate a stream for a request accepted with `Streaming`
    pub async fn end_stream(&self, id: &RequestId, outcome: DurableOutcome) -> Result<()> {
        let now = self.time_source.now();
        let message = match &outcome {
            Ok(value) => {
                self.with_tracker(|t| t.complete(id, value.clone(), now))?;
                WireMessage::StreamEnd {
                    message_id: id.clone(),
                    success: true,
                    data: Some(value.clone()),
                    error: None,
                }
            }
            Err(error) => {
                self.with_tracker(|t| t.fail(id, error.clone(), now))?;
                WireMessage::StreamEnd {
                    message_id: id.clone(),
                    success: false,
                    data: None,
                    error: Some(error.clone()),
                }
            }
        };
        self.channel.send(message).await
    }

    // ------------------------------------------------------------------
    // Periodic maintenance
    // ------------------------------------------------------------------

    /// Reap streams whose silence window closed: the subscriber gets a soft
    /// timeout error, the tracker entry goes terminal, and a late stream end
    /// stays eligible for dispatcher delivery.
    pub fn reap_stream_timeouts(&self) -> usize {
        let expired = self.stream_timeouts.poll_expired();
        let count = expired.len();
        for expiry in expired {
            let now = self.time_source.now();
            let _ = self.with_tracker(|t| t.mark_timed_out(&expiry.id, now));
            let synthetic = WireMessage::StreamEnd {
                message_id: expiry.id.clone(),
                success: false,
                data: None,
                error: Some(ErrorInfo::new(
                    format!("no stream progress for {}ms", expiry.silent_for_ms),
                    "stream_timeout",
                )),
            };
            self.streaming.on_message(&synthetic, now);
            // Forget the finished slot so a genuine late end is buffered
            // instead of dropped
            self.streaming.forget(&expiry.id);
        }
        count
    }

    /// Re-offer queued results (flush timer, context reattachment)
    pub async fn flush_dispatcher(&self) -> crate::dispatcher::FlushReport {
        self.dispatcher.flush().await
    }

    /// One pass of tracker/stream/dispatcher housekeeping
    pub fn run_sweep(&self) -> SweepReport {
        let now = self.time_source.now();
        let report = self
            .tracker
            .lock()
            .map(|mut t| t.sweep(now))
            .unwrap_or_default();
        self.streaming.sweep(now, self.config.tracker.terminal_retention);
        self.dispatcher
            .sweep_finalized(self.config.tracker.terminal_retention);
        report
    }

    /// Tracker occupancy snapshot
    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker
            .lock()
            .map(|t| t.stats())
            .unwrap_or_default()
    }

    /// Status of one request
    pub fn request_status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.tracker.lock().ok().and_then(|t| t.status(id))
    }

    /// The channel this coordinator sends on
    pub fn channel(&self) -> &Arc<TransportChannel> {
        &self.channel
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn with_tracker<R>(&self, f: impl FnOnce(&mut RequestTracker) -> Result<R>) -> Result<R> {
        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| CrosslinkError::channel_error("tracker lock poisoned"))?;
        f(&mut tracker)
    }
}
