//! Streaming response plumbing
//!
//! Routes STREAM_UPDATE/STREAM_END traffic to per-id subscribers. Updates
//! that race ahead of subscriber registration are buffered in a small
//! per-id FIFO and replayed in order; duplicate or stale sequence numbers
//! and post-terminal traffic are dropped.

pub mod timeout;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crosslink_core::config::StreamingConfig;
use crosslink_core::message::{ErrorInfo, WireMessage};
use crosslink_core::types::{RequestId, Timestamp};

pub use timeout::{StreamExpiry, StreamingTimeoutManager};

// ----------------------------------------------------------------------------
// Stream Events
// ----------------------------------------------------------------------------

/// An event delivered to a stream subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Partial progress
    Update { seq: u64, data: Value },
    /// Terminal event; nothing follows
    End {
        outcome: core::result::Result<Value, ErrorInfo>,
    },
}

// ----------------------------------------------------------------------------
// Per-Stream Slots
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum StreamSlot {
    /// Messages arrived before anyone subscribed
    Early {
        buffer: VecDeque<StreamEvent>,
        last_seq: Option<u64>,
        since: Timestamp,
    },
    /// Live subscriber attached
    Subscribed {
        sender: mpsc::UnboundedSender<StreamEvent>,
        last_seq: Option<u64>,
    },
    /// Terminal event already forwarded; later traffic is dropped
    Finished,
}

// ----------------------------------------------------------------------------
// Streaming Response Handler
// ----------------------------------------------------------------------------

/// Demultiplexes stream traffic to per-id subscribers
pub struct StreamingResponseHandler {
    config: StreamingConfig,
    slots: Mutex<HashMap<RequestId, StreamSlot>>,
}

impl StreamingResponseHandler {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the stream for `id`. Any buffered early events are
    /// replayed, in arrival order, before live traffic.
    pub fn subscribe(&self, id: &RequestId) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(mut slots) = self.slots.lock() else {
            return rx;
        };
        let last_seq = match slots.remove(id) {
            Some(StreamSlot::Early { buffer, last_seq, .. }) => {
                trace!(id = %id, buffered = buffer.len(), "replaying early stream events");
                for event in buffer {
                    let _ = tx.send(event);
                }
                last_seq
            }
            Some(StreamSlot::Finished) => {
                // Stream already over; subscriber gets nothing further
                slots.insert(id.clone(), StreamSlot::Finished);
                return rx;
            }
            Some(StreamSlot::Subscribed { last_seq, .. }) => {
                warn!(id = %id, "replacing existing stream subscriber");
                last_seq
            }
            None => None,
        };
        slots.insert(id.clone(), StreamSlot::Subscribed { sender: tx, last_seq });
        rx
    }

    /// Feed an inbound wire message. Returns true when it was stream
    /// traffic (consumed or deliberately dropped).
    pub fn on_message(&self, message: &WireMessage, now: Timestamp) -> bool {
        match message {
            WireMessage::StreamUpdate {
                message_id,
                seq,
                data,
            } => {
                self.on_update(message_id, *seq, data.clone(), now);
                true
            }
            WireMessage::StreamEnd {
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
                        .unwrap_or_else(|| ErrorInfo::new("stream failed", "destination")))
                };
                self.on_end(message_id, outcome, now);
                true
            }
            _ => false,
        }
    }

    fn on_update(&self, id: &RequestId, seq: u64, data: Value, now: Timestamp) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        match slots.get_mut(id) {
            Some(StreamSlot::Subscribed { sender, last_seq }) => {
                if stale(last_seq, seq) {
                    trace!(id = %id, seq, "dropping stale stream update");
                    return;
                }
                *last_seq = Some(seq);
                let _ = sender.send(StreamEvent::Update { seq, data });
            }
            Some(StreamSlot::Early { buffer, last_seq, .. }) => {
                if stale(last_seq, seq) {
                    return;
                }
                *last_seq = Some(seq);
                if buffer.len() >= self.config.early_buffer_capacity {
                    // Oldest out first; the subscriber missed it
                    buffer.pop_front();
                }
                buffer.push_back(StreamEvent::Update { seq, data });
            }
            Some(StreamSlot::Finished) => {
                debug!(id = %id, seq, "dropping update after stream end");
            }
            None => {
                let mut buffer = VecDeque::with_capacity(self.config.early_buffer_capacity);
                buffer.push_back(StreamEvent::Update { seq, data });
                slots.insert(
                    id.clone(),
                    StreamSlot::Early {
                        buffer,
                        last_seq: Some(seq),
                        since: now,
                    },
                );
            }
        }
    }

    fn on_end(
        &self,
        id: &RequestId,
        outcome: core::result::Result<Value, ErrorInfo>,
        now: Timestamp,
    ) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        match slots.remove(id) {
            Some(StreamSlot::Subscribed { sender, .. }) => {
                let _ = sender.send(StreamEvent::End { outcome });
                slots.insert(id.clone(), StreamSlot::Finished);
            }
            Some(StreamSlot::Early { mut buffer, last_seq, since }) => {
                buffer.push_back(StreamEvent::End { outcome });
                slots.insert(
                    id.clone(),
                    StreamSlot::Early { buffer, last_seq, since },
                );
            }
            Some(StreamSlot::Finished) => {
                debug!(id = %id, "dropping duplicate stream end");
                slots.insert(id.clone(), StreamSlot::Finished);
            }
            None => {
                let mut buffer = VecDeque::with_capacity(1);
                buffer.push_back(StreamEvent::End { outcome });
                slots.insert(
                    id.clone(),
                    StreamSlot::Early {
                        buffer,
                        last_seq: None,
                        since: now,
                    },
                );
            }
        }
    }

    /// Drop all state for `id`
    pub fn forget(&self, id: &RequestId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(id);
        }
    }

    /// Drop finished markers and unclaimed early buffers older than
    /// `max_age`. Returns the number of entries removed.
    pub fn sweep(&self, now: Timestamp, max_age: std::time::Duration) -> usize {
        let Ok(mut slots) = self.slots.lock() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            StreamSlot::Early { since, .. } => now.duration_since(*since) <= max_age,
            StreamSlot::Finished => false,
            StreamSlot::Subscribed { .. } => true,
        });
        before - slots.len()
    }

    /// Number of tracked streams (any state)
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stale(last_seq: &Option<u64>, seq: u64) -> bool {
    matches!(last_seq, Some(last) if seq <= *last)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
