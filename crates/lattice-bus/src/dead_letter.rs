//! # Dead-Letter Queue
//!
//! Terminal parking lot for messages that exhausted every delivery attempt.
//! Records are immutable and inspect-only; an operator may replay one, which
//! re-enqueues a fresh copy and leaves the record untouched.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_types::message::now_ms;
use shared_types::{Message, MessageStatus};
use uuid::Uuid;

/// An immutable record of a dead-lettered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The message as it was when dead-lettered.
    pub message: Message,
    /// Why the final attempt failed.
    pub reason: String,
    /// When the message was dead-lettered, Unix millis.
    pub dead_lettered_at_ms: u64,
}

/// Queryable store of dead-lettered messages.
pub struct DeadLetterQueue {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Park a message. Its status is pinned to `DeadLettered`.
    pub fn park(&self, mut message: Message, reason: impl Into<String>) {
        message.status = MessageStatus::DeadLettered;
        self.records.write().push(DeadLetterRecord {
            message,
            reason: reason.into(),
            dead_lettered_at_ms: now_ms(),
        });
    }

    /// Snapshot of all records for inspection.
    #[must_use]
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().clone()
    }

    /// Look up a record by message id.
    #[must_use]
    pub fn find(&self, message_id: Uuid) -> Option<DeadLetterRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.message.id == message_id)
            .cloned()
    }

    /// Build a fresh copy of a dead-lettered message for operator replay.
    ///
    /// The copy gets a new id and a reset attempt budget; the original
    /// record stays in the queue unchanged.
    #[must_use]
    pub fn replay_copy(&self, message_id: Uuid) -> Option<Message> {
        let record = self.find(message_id)?;
        let mut copy = record.message;
        copy.id = Uuid::new_v4();
        copy.attempt_count = 0;
        copy.status = MessageStatus::Pending;
        copy.created_at_ms = now_ms();
        Some(copy)
    }

    /// Number of parked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing has been dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_types::ModuleId;

    fn failed_message() -> Message {
        let mut msg = Message::request(ModuleId::new("a"), ModuleId::new("b"), "x", json!({}));
        msg.attempt_count = msg.max_attempts;
        msg.status = MessageStatus::Failed;
        msg
    }

    #[test]
    fn test_park_pins_status() {
        let dlq = DeadLetterQueue::new();
        let msg = failed_message();
        let id = msg.id;

        dlq.park(msg, "handler kept failing");

        let record = dlq.find(id).unwrap();
        assert_eq!(record.message.status, MessageStatus::DeadLettered);
        assert_eq!(record.reason, "handler kept failing");
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_replay_copy_resets_budget() {
        let dlq = DeadLetterQueue::new();
        let msg = failed_message();
        let id = msg.id;
        dlq.park(msg, "exhausted");

        let copy = dlq.replay_copy(id).unwrap();
        assert_ne!(copy.id, id);
        assert_eq!(copy.attempt_count, 0);
        assert_eq!(copy.status, MessageStatus::Pending);

        // Original record untouched
        let record = dlq.find(id).unwrap();
        assert_eq!(record.message.status, MessageStatus::DeadLettered);
    }

    #[test]
    fn test_find_missing() {
        let dlq = DeadLetterQueue::new();
        assert!(dlq.find(Uuid::new_v4()).is_none());
        assert!(dlq.replay_copy(Uuid::new_v4()).is_none());
        assert!(dlq.is_empty());
    }
}
