//! Request lifecycle tracking and deduplication
//!
//! The RequestTracker is the authoritative record of every in-flight logical
//! operation. It owns each Request from creation to terminal state, keeps
//! secondary indexes (by origin tab, by UI correlation id, weakly by DOM
//! element), and is the system's single deduplication point: resubmitting a
//! live id errors, resubmitting a completed id replays the cached outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::errors::{CrosslinkError, Result};
use crate::message::ErrorInfo;
use crate::types::{
    CorrelationId, ExecutionContext, OperationMode, Priority, RequestId, TabId, Timestamp,
};

// ----------------------------------------------------------------------------
// Request Status
// ----------------------------------------------------------------------------

/// Lifecycle status of a tracked request. Transitions move forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Streaming,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    /// Whether this status has no further legal transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether moving to `next` is a legal forward transition
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Forward only: no re-entering earlier phases
            (Self::Pending, Self::Processing) | (Self::Pending, Self::Streaming) => true,
            (Self::Processing, Self::Streaming) => true,
            (_, s) if s.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

// ----------------------------------------------------------------------------
// Element Anchor
// ----------------------------------------------------------------------------

/// Anchor object standing in for a DOM element on the caller's side.
///
/// The tracker only ever holds a [`Weak`] to the anchor, so index entries
/// vanish with the element and are never kept alive by the index.
#[derive(Debug)]
pub struct ElementAnchor {
    label: String,
}

/// Caller-owned strong handle to an element anchor
#[derive(Debug, Clone)]
pub struct ElementRef(Arc<ElementAnchor>);

impl ElementRef {
    pub fn new<T: Into<String>>(label: T) -> Self {
        Self(Arc::new(ElementAnchor {
            label: label.into(),
        }))
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn downgrade(&self) -> Weak<ElementAnchor> {
        Arc::downgrade(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Operation Request
// ----------------------------------------------------------------------------

/// A caller-built operation submission
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Caller-generated, globally unique id
    pub id: RequestId,
    /// Feature action string ("translate.text", "settings.get", ...)
    pub action: String,
    /// Operation payload
    pub payload: Value,
    /// Context the request originated from
    pub origin: ExecutionContext,
    /// Context the request is addressed to
    pub destination: ExecutionContext,
    /// Scheduling hint
    pub priority: Priority,
    /// Whether the fast exchange may be retried for this operation
    pub idempotent: bool,
    /// UI correlation id, if the request was born from a UI interaction
    pub correlation_id: Option<CorrelationId>,
    /// DOM element the request is anchored to, if any
    pub element: Option<ElementRef>,
}

impl OperationRequest {
    /// Create a request addressed to the background worker
    pub fn new<A: Into<String>>(
        id: RequestId,
        action: A,
        payload: Value,
        origin: ExecutionContext,
    ) -> Self {
        Self {
            id,
            action: action.into(),
            payload,
            origin,
            destination: ExecutionContext::Background,
            priority: Priority::default(),
            idempotent: true,
            correlation_id: None,
            element: None,
        }
    }

    pub fn with_destination(mut self, destination: ExecutionContext) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the operation as non-idempotent; fast-exchange retries are
    /// skipped entirely for such operations
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_element(mut self, element: ElementRef) -> Self {
        self.element = Some(element);
        self
    }
}

// ----------------------------------------------------------------------------
// Tracked Request
// ----------------------------------------------------------------------------

/// A request under tracker ownership
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub id: RequestId,
    pub action: String,
    pub payload: Value,
    pub origin: ExecutionContext,
    pub priority: Priority,
    pub mode: OperationMode,
    pub status: RequestStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub correlation_id: Option<CorrelationId>,
    /// Cached terminal outcome, replayed on duplicate submission
    outcome: Option<core::result::Result<Value, ErrorInfo>>,
    tab_id: Option<TabId>,
    element_key: Option<usize>,
}

impl TrackedRequest {
    /// Cached terminal outcome, if any
    pub fn outcome(&self) -> Option<&core::result::Result<Value, ErrorInfo>> {
        self.outcome.as_ref()
    }
}

// ----------------------------------------------------------------------------
// Admit Outcome / Completion Record
// ----------------------------------------------------------------------------

/// Outcome of admitting a request id
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// New id, now tracked
    Admitted,
    /// Duplicate of a completed operation: cached result, handler not re-run
    CachedResult(Value),
    /// Duplicate of a terminally failed/cancelled/timed-out operation
    CachedFailure(ErrorInfo),
}

/// Completion metadata handed to the ResultDispatcher
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub id: RequestId,
    pub action: String,
    pub origin: ExecutionContext,
    pub correlation_id: Option<CorrelationId>,
    pub completed_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Request Tracker
// ----------------------------------------------------------------------------

/// Authoritative record of in-flight logical operations
#[derive(Debug)]
pub struct RequestTracker {
    config: TrackerConfig,
    requests: HashMap<RequestId, TrackedRequest>,
    by_tab: HashMap<TabId, HashSet<RequestId>>,
    by_correlation: HashMap<CorrelationId, RequestId>,
    by_element: HashMap<usize, (Weak<ElementAnchor>, RequestId)>,
}

impl RequestTracker {
    /// Create a tracker with the given retention configuration
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            requests: HashMap::new(),
            by_tab: HashMap::new(),
            by_correlation: HashMap::new(),
            by_element: HashMap::new(),
        }
    }

    /// Admit a request under tracker ownership.
    ///
    /// This is the single deduplication point: an id colliding with a live
    /// entry errors with [`CrosslinkError::StillProcessing`]; an id colliding
    /// with a terminal entry replays the cached outcome without re-invoking
    /// any handler.
    pub fn admit(&mut self, request: OperationRequest, now: Timestamp) -> Result<AdmitOutcome> {
        if let Some(existing) = self.requests.get(&request.id) {
            if existing.status.is_terminal() {
                debug!(id = %request.id, status = existing.status.as_str(), "replaying cached outcome for duplicate");
                return Ok(match existing.outcome() {
                    Some(Ok(value)) => AdmitOutcome::CachedResult(value.clone()),
                    Some(Err(error)) => AdmitOutcome::CachedFailure(error.clone()),
                    None => AdmitOutcome::CachedFailure(ErrorInfo::new(
                        format!("operation ended as {}", existing.status.as_str()),
                        existing.status.as_str(),
                    )),
                });
            }
            return Err(CrosslinkError::StillProcessing {
                id: request.id.clone(),
            });
        }

        let tab_id = request.origin.tab_id();
        let element_key = request.element.as_ref().map(|e| e.key());

        if let Some(tab) = tab_id {
            self.by_tab.entry(tab).or_default().insert(request.id.clone());
        }
        if let Some(correlation) = &request.correlation_id {
            self.by_correlation
                .insert(correlation.clone(), request.id.clone());
        }
        if let Some(element) = &request.element {
            self.by_element
                .insert(element.key(), (element.downgrade(), request.id.clone()));
        }

        self.requests.insert(
            request.id.clone(),
            TrackedRequest {
                id: request.id,
                action: request.action,
                payload: request.payload,
                origin: request.origin,
                priority: request.priority,
                mode: OperationMode::Regular,
                status: RequestStatus::Pending,
                created_at: now,
                completed_at: None,
                correlation_id: request.correlation_id,
                outcome: None,
                tab_id,
                element_key,
            },
        );
        Ok(AdmitOutcome::Admitted)
    }

    /// Move a request into the processing phase
    pub fn mark_processing(&mut self, id: &RequestId) -> Result<()> {
        self.transition(id, RequestStatus::Processing)
    }

    /// Move a request into the streaming phase
    pub fn mark_streaming(&mut self, id: &RequestId) -> Result<()> {
        self.transition(id, RequestStatus::Streaming)?;
        if let Some(entry) = self.requests.get_mut(id) {
            entry.mode = OperationMode::Streaming;
        }
        Ok(())
    }

    /// Complete a request: flips status, stamps completion time, caches the
    /// result and removes the id from all secondary indexes in one step.
    pub fn complete(
        &mut self,
        id: &RequestId,
        result: Value,
        now: Timestamp,
    ) -> Result<CompletionRecord> {
        self.finish(id, RequestStatus::Completed, Ok(result), now)
    }

    /// Terminally fail a request
    pub fn fail(
        &mut self,
        id: &RequestId,
        error: ErrorInfo,
        now: Timestamp,
    ) -> Result<CompletionRecord> {
        self.finish(id, RequestStatus::Failed, Err(error), now)
    }

    /// Mark a request as timed out (soft: a late result may still arrive and
    /// be delivered through the dispatcher, but the entry stays terminal)
    pub fn mark_timed_out(&mut self, id: &RequestId, now: Timestamp) -> Result<()> {
        let error = ErrorInfo::new("operation timed out", "timeout");
        self.finish(id, RequestStatus::TimedOut, Err(error), now)?;
        Ok(())
    }

    /// Cancel a non-terminal request. Cancelling a terminal entry errors as
    /// a no-op.
    pub fn cancel(&mut self, id: &RequestId, reason: &str, now: Timestamp) -> Result<()> {
        let status = self.status(id).ok_or_else(|| CrosslinkError::UnknownRequest {
            id: id.clone(),
        })?;
        if status.is_terminal() {
            return Err(CrosslinkError::AlreadyTerminal {
                id: id.clone(),
                status: status.as_str(),
            });
        }
        let error = ErrorInfo::new(format!("cancelled: {reason}"), "cancelled");
        self.finish(id, RequestStatus::Cancelled, Err(error), now)?;
        Ok(())
    }

    /// Drop a request entirely (used when the outcome was already handed to
    /// the caller synchronously and duplicate replay is not needed)
    pub fn remove(&mut self, id: &RequestId) -> Option<TrackedRequest> {
        let entry = self.requests.remove(id)?;
        self.detach_indexes(&entry);
        Some(entry)
    }

    /// Get a tracked request
    pub fn get(&self, id: &RequestId) -> Option<&TrackedRequest> {
        self.requests.get(id)
    }

    /// Current status of a request
    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.requests.get(id).map(|r| r.status)
    }

    /// Ids of live requests originating from the given tab
    pub fn requests_for_tab(&self, tab_id: TabId) -> Vec<RequestId> {
        self.by_tab
            .get(&tab_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Id of the live request bound to the given UI correlation id
    pub fn request_for_correlation(&self, correlation_id: &CorrelationId) -> Option<&RequestId> {
        self.by_correlation.get(correlation_id)
    }

    /// Id of the live request anchored to the given element, if the element
    /// is still alive
    pub fn request_for_element(&self, element: &ElementRef) -> Option<RequestId> {
        let (weak, id) = self.by_element.get(&element.key())?;
        weak.upgrade().map(|_| id.clone())
    }

    /// Number of tracked requests (including retained terminal entries)
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Periodic sweep: purges terminal entries older than the retention
    /// window, stuck non-terminal entries older than the long ceiling, and
    /// element index entries whose anchor has been dropped.
    pub fn sweep(&mut self, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();

        let terminal_retention = self.config.terminal_retention;
        let stuck_ceiling = self.config.stuck_ceiling;
        let mut reaped: Vec<RequestId> = Vec::new();

        for (id, entry) in &self.requests {
            if entry.status.is_terminal() {
                let completed = entry.completed_at.unwrap_or(entry.created_at);
                if now.duration_since(completed) > terminal_retention {
                    reaped.push(id.clone());
                    report.terminal_purged += 1;
                }
            } else if now.duration_since(entry.created_at) > stuck_ceiling {
                warn!(id = %id, status = entry.status.as_str(), "reaping stuck request");
                reaped.push(id.clone());
                report.stuck_purged += 1;
            }
        }
        for id in reaped {
            if let Some(entry) = self.requests.remove(&id) {
                self.detach_indexes(&entry);
            }
        }

        let before = self.by_element.len();
        self.by_element.retain(|_, (weak, _)| weak.upgrade().is_some());
        report.element_entries_pruned = before - self.by_element.len();

        if report.total() > 0 {
            info!(
                terminal = report.terminal_purged,
                stuck = report.stuck_purged,
                elements = report.element_entries_pruned,
                "tracker sweep reaped entries"
            );
        }
        report
    }

    /// Snapshot of tracker occupancy
    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::default();
        for entry in self.requests.values() {
            stats.total += 1;
            match entry.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Processing => stats.processing += 1,
                RequestStatus::Streaming => stats.streaming += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Cancelled => stats.cancelled += 1,
                RequestStatus::TimedOut => stats.timed_out += 1,
            }
        }
        stats.tabs_indexed = self.by_tab.len();
        stats.elements_indexed = self.by_element.len();
        stats
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(&mut self, id: &RequestId, next: RequestStatus) -> Result<()> {
        let entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| CrosslinkError::UnknownRequest { id: id.clone() })?;
        if !entry.status.can_transition_to(next) {
            return Err(CrosslinkError::InvalidTransition {
                id: id.clone(),
                from: entry.status.as_str(),
                to: next.as_str(),
            });
        }
        entry.status = next;
        Ok(())
    }

    fn finish(
        &mut self,
        id: &RequestId,
        status: RequestStatus,
        outcome: core::result::Result<Value, ErrorInfo>,
        now: Timestamp,
    ) -> Result<CompletionRecord> {
        self.transition(id, status)?;
        // Single synchronous step: status, stamp, cache and index removal
        // complete together with no partial visibility.
        let entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| CrosslinkError::UnknownRequest { id: id.clone() })?;
        entry.completed_at = Some(now);
        entry.outcome = Some(outcome);
        let record = CompletionRecord {
            id: entry.id.clone(),
            action: entry.action.clone(),
            origin: entry.origin.clone(),
            correlation_id: entry.correlation_id.clone(),
            completed_at: now,
        };
        let tab_id = entry.tab_id;
        let correlation_id = entry.correlation_id.clone();
        let element_key = entry.element_key;
        self.detach_secondary(id, tab_id, correlation_id.as_ref(), element_key);
        Ok(record)
    }

    fn detach_indexes(&mut self, entry: &TrackedRequest) {
        self.detach_secondary(
            &entry.id,
            entry.tab_id,
            entry.correlation_id.as_ref(),
            entry.element_key,
        );
    }

    fn detach_secondary(
        &mut self,
        id: &RequestId,
        tab_id: Option<TabId>,
        correlation_id: Option<&CorrelationId>,
        element_key: Option<usize>,
    ) {
        if let Some(tab) = tab_id {
            if let Some(ids) = self.by_tab.get_mut(&tab) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_tab.remove(&tab);
                }
            }
        }
        if let Some(correlation) = correlation_id {
            if self.by_correlation.get(correlation) == Some(id) {
                self.by_correlation.remove(correlation);
            }
        }
        if let Some(key) = element_key {
            if self.by_element.get(&key).map(|(_, id)| id) == Some(id) {
                self.by_element.remove(&key);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Sweep Report / Statistics
// ----------------------------------------------------------------------------

/// Counts reaped by one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub terminal_purged: usize,
    pub stuck_purged: usize,
    pub element_entries_pruned: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.terminal_purged + self.stuck_purged + self.element_entries_pruned
    }
}

/// Snapshot of tracker occupancy by status
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub streaming: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub tabs_indexed: usize,
    pub elements_indexed: usize,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
