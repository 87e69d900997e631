//! # Message Envelope
//!
//! The universal unit of communication carried by the bus. Request/response
//! flows correlate on [`Message::correlation_id`]; broadcast messages leave
//! `target_module` empty.

use crate::module::ModuleId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Communication pattern for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessagePattern {
    /// Caller blocks (with timeout) for a correlated response.
    RequestResponse,
    /// Fire-and-forget publication to subscribers of a topic.
    PubSub,
    /// Delivered to every registered module.
    Broadcast,
    /// One-way delivery to a single module, no response expected.
    PointToPoint,
}

/// Delivery priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessagePriority {
    /// Background work.
    Low,
    /// Default priority.
    Normal,
    /// Latency-sensitive traffic.
    High,
    /// Dispatched before everything else.
    Critical,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Lifecycle status of a message.
///
/// `DeadLettered` is terminal: the message is immutable afterwards and is
/// never re-delivered automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is dispatching it.
    Processing,
    /// Handler acknowledged success.
    Delivered,
    /// Last attempt failed; may still be retried.
    Failed,
    /// All attempts exhausted. Terminal.
    DeadLettered,
}

/// A message exchanged between modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: Uuid,
    /// Correlates a response with its originating request.
    pub correlation_id: Uuid,
    /// The sending module.
    pub source_module: ModuleId,
    /// The receiving module. `None` for broadcast.
    pub target_module: Option<ModuleId>,
    /// Communication pattern.
    pub pattern: MessagePattern,
    /// Action or topic name the target dispatches on.
    pub action: String,
    /// Message body.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// Creation time, Unix millis.
    pub created_at_ms: u64,
    /// Delivery attempts made so far. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    /// Attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Current lifecycle status.
    pub status: MessageStatus,
}

impl Message {
    /// Create a request-response message.
    pub fn request(
        source: ModuleId,
        target: ModuleId,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            source,
            Some(target),
            MessagePattern::RequestResponse,
            action,
            payload,
        )
    }

    /// Create a one-way point-to-point message.
    pub fn point_to_point(
        source: ModuleId,
        target: ModuleId,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            source,
            Some(target),
            MessagePattern::PointToPoint,
            action,
            payload,
        )
    }

    /// Create a broadcast message delivered to every registered module.
    pub fn broadcast(
        source: ModuleId,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(source, None, MessagePattern::Broadcast, action, payload)
    }

    fn new(
        source: ModuleId,
        target: Option<ModuleId>,
        pattern: MessagePattern,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            source_module: source,
            target_module: target,
            pattern,
            action: action.into(),
            payload,
            priority: MessagePriority::default(),
            created_at_ms: now_ms(),
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status: MessageStatus::Pending,
        }
    }

    /// Set the priority (builder style).
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt budget (builder style).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// True once every delivery attempt has been used.
    #[must_use]
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
