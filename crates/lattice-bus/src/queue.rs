//! # Delivery Queue
//!
//! A bounded, thread-safe priority queue. Critical > High > Normal > Low;
//! FIFO within each priority. This orders dequeues only; end-to-end
//! per-pair delivery ordering is enforced by the bus's per-pair lanes.

use parking_lot::Mutex;
use shared_types::{CommsError, Message, MessagePriority};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Priorities in dispatch order, highest first.
const PRIORITY_ORDER: [MessagePriority; 4] = [
    MessagePriority::Critical,
    MessagePriority::High,
    MessagePriority::Normal,
    MessagePriority::Low,
];

/// Bounded multi-priority FIFO queue shared by all delivery workers.
pub struct DeliveryQueue {
    /// One FIFO lane per priority, indexed by [`lane_index`].
    lanes: Mutex<[VecDeque<Message>; 4]>,
    /// Capacity of each lane.
    capacity: usize,
    /// Wakes workers when a message arrives or the queue closes.
    notify: Notify,
    /// Set on shutdown; workers drain and exit.
    closed: AtomicBool,
}

fn lane_index(priority: MessagePriority) -> usize {
    match priority {
        MessagePriority::Critical => 0,
        MessagePriority::High => 1,
        MessagePriority::Normal => 2,
        MessagePriority::Low => 3,
    }
}

impl DeliveryQueue {
    /// Create a queue with the given per-priority capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new([
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ]),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a message at its priority.
    ///
    /// # Errors
    ///
    /// `CommsError::QueueFull` if the priority lane is at capacity.
    pub fn push(&self, message: Message) -> Result<(), CommsError> {
        {
            let mut lanes = self.lanes.lock();
            let lane = &mut lanes[lane_index(message.priority)];
            if lane.len() >= self.capacity {
                return Err(CommsError::QueueFull {
                    capacity: self.capacity,
                });
            }
            lane.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the highest-priority message without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<Message> {
        let mut lanes = self.lanes.lock();
        for priority in PRIORITY_ORDER {
            if let Some(message) = lanes[lane_index(priority)].pop_front() {
                return Some(message);
            }
        }
        None
    }

    /// Dequeue the highest-priority message, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            // Arm the notification before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();

            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Close the queue. Workers finish the backlog and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total queued messages across all priorities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_types::ModuleId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn message(priority: MessagePriority, action: &str) -> Message {
        Message::request(ModuleId::new("a"), ModuleId::new("b"), action, json!({}))
            .with_priority(priority)
    }

    #[test]
    fn test_priority_order() {
        let queue = DeliveryQueue::new(16);
        queue.push(message(MessagePriority::Low, "low")).unwrap();
        queue.push(message(MessagePriority::Critical, "crit")).unwrap();
        queue.push(message(MessagePriority::Normal, "norm")).unwrap();
        queue.push(message(MessagePriority::High, "high")).unwrap();

        assert_eq!(queue.try_pop().unwrap().action, "crit");
        assert_eq!(queue.try_pop().unwrap().action, "high");
        assert_eq!(queue.try_pop().unwrap().action, "norm");
        assert_eq!(queue.try_pop().unwrap().action, "low");
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = DeliveryQueue::new(16);
        for i in 0..5 {
            queue
                .push(message(MessagePriority::Normal, &format!("m{i}")))
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.try_pop().unwrap().action, format!("m{i}"));
        }
    }

    #[test]
    fn test_capacity_bound() {
        let queue = DeliveryQueue::new(2);
        queue.push(message(MessagePriority::Normal, "a")).unwrap();
        queue.push(message(MessagePriority::Normal, "b")).unwrap();

        let result = queue.push(message(MessagePriority::Normal, "c"));
        assert!(matches!(result, Err(CommsError::QueueFull { capacity: 2 })));

        // Other lanes are unaffected
        queue.push(message(MessagePriority::High, "d")).unwrap();
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new(16));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(message(MessagePriority::Normal, "late")).unwrap();

        let popped = timeout(Duration::from_secs(1), popper)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(popped.unwrap().action, "late");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = DeliveryQueue::new(16);
        queue.push(message(MessagePriority::Normal, "x")).unwrap();
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }
}
