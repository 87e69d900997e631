//! # Domain Events
//!
//! Events are immutable once appended; corrections are modeled as new
//! compensating events, never mutation. `stream_id` and `sequence_no` are
//! assigned by the store at append time.

use serde::{Deserialize, Serialize};
use shared_types::message::now_ms;
use uuid::Uuid;

/// An immutable domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub event_id: Uuid,
    /// The stream this event belongs to. Assigned at append.
    pub stream_id: String,
    /// Position within the stream, starting at 1. Assigned at append.
    pub sequence_no: u64,
    /// Event name (e.g. `"order.placed"`).
    pub event_name: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// When the event occurred, Unix millis.
    pub occurred_at_ms: u64,
    /// The event that directly caused this one, if any.
    pub causation_id: Option<Uuid>,
    /// Groups events belonging to one logical flow.
    pub correlation_id: Option<Uuid>,
}

impl Event {
    /// Create an event not yet bound to a stream.
    pub fn new(event_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            stream_id: String::new(),
            sequence_no: 0,
            event_name: event_name.into(),
            payload,
            occurred_at_ms: now_ms(),
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Record what caused this event (builder style).
    #[must_use]
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Attach a correlation id (builder style).
    #[must_use]
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
