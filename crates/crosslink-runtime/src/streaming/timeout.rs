//! Adaptive streaming timeout tracking
//!
//! Watches registered streams for silence. Deadlines come from the
//! payload-scaled windows in `crosslink-core`; expiry here is SOFT: the
//! waiting caller gets an error, but the underlying work is not torn down
//! and a late completion still flows through the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crosslink_core::timeouts::StreamingTimeouts;
use crosslink_core::types::{RequestId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Deadline State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StreamDeadline {
    timeouts: StreamingTimeouts,
    started_at: Timestamp,
    last_progress_at: Option<Timestamp>,
    /// A single grace extension after the first missed progress window
    grace_granted: bool,
}

impl StreamDeadline {
    fn deadline(&self) -> Timestamp {
        let base = match self.last_progress_at {
            None => self.started_at + self.timeouts.initial.as_millis() as u64,
            Some(t) => t + self.timeouts.progress.as_millis() as u64,
        };
        if self.grace_granted {
            base + self.timeouts.grace.as_millis() as u64
        } else {
            base
        }
    }

    fn hard_deadline(&self, ceiling: Duration) -> Timestamp {
        self.started_at + ceiling.as_millis() as u64
    }
}

/// A stream whose silence window expired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamExpiry {
    pub id: RequestId,
    /// Milliseconds of silence when the window closed
    pub silent_for_ms: u64,
}

// ----------------------------------------------------------------------------
// Streaming Timeout Manager
// ----------------------------------------------------------------------------

/// Tracks silence deadlines for every live stream
pub struct StreamingTimeoutManager {
    time_source: Arc<dyn TimeSource>,
    hard_ceiling: Duration,
    entries: Mutex<HashMap<RequestId, StreamDeadline>>,
}

impl StreamingTimeoutManager {
    pub fn new(hard_ceiling: Duration, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            time_source,
            hard_ceiling,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a stream with the given windows
    pub fn register(&self, id: RequestId, timeouts: StreamingTimeouts) {
        let started_at = self.time_source.now();
        trace!(id = %id, ?timeouts, "watching stream");
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id,
                StreamDeadline {
                    timeouts,
                    started_at,
                    last_progress_at: None,
                    grace_granted: false,
                },
            );
        }
    }

    /// Record a progress event: resets the silence window and re-arms the
    /// one-shot grace extension. Returns false for unwatched ids.
    pub fn notify_progress(&self, id: &RequestId) -> bool {
        let now = self.time_source.now();
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        match entries.get_mut(id) {
            Some(entry) => {
                entry.last_progress_at = Some(now);
                entry.grace_granted = false;
                true
            }
            None => false,
        }
    }

    /// Stop watching a stream (terminal event arrived or caller abandoned)
    pub fn unregister(&self, id: &RequestId) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Collect and remove every stream whose window has closed.
    ///
    /// A stream that has shown progress gets one grace extension before it
    /// expires; the hard ceiling on total lifetime is never extended.
    pub fn poll_expired(&self) -> Vec<StreamExpiry> {
        let now = self.time_source.now();
        let mut expired = Vec::new();
        let Ok(mut entries) = self.entries.lock() else {
            return expired;
        };

        let mut grace: Vec<RequestId> = Vec::new();
        for (id, entry) in entries.iter() {
            let over_ceiling = now > entry.hard_deadline(self.hard_ceiling);
            if now > entry.deadline() || over_ceiling {
                if !over_ceiling && !entry.grace_granted && entry.last_progress_at.is_some() {
                    grace.push(id.clone());
                    continue;
                }
                let silent_since = entry.last_progress_at.unwrap_or(entry.started_at);
                expired.push(StreamExpiry {
                    id: id.clone(),
                    silent_for_ms: now.duration_since(silent_since).as_millis() as u64,
                });
            }
        }
        for id in grace {
            if let Some(entry) = entries.get_mut(&id) {
                debug!(id = %id, "granting grace extension to quiet stream");
                entry.grace_granted = true;
            }
        }
        for expiry in &expired {
            entries.remove(&expiry.id);
            debug!(id = %expiry.id, silent_for_ms = expiry.silent_for_ms, "stream silence window expired");
        }
        expired
    }

    /// Number of watched streams
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
