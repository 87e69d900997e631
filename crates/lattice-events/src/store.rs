//! # Event Store
//!
//! Append-only log partitioned by stream. The store assigns the next
//! `sequence_no` under a per-stream exclusive section, so concurrent
//! appends to one stream never produce duplicate or out-of-order numbers;
//! appends to different streams proceed independently.

use crate::event::Event;
use crate::DEFAULT_SNAPSHOT_INTERVAL;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::message::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Event store tunables.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Events between snapshots; [`EventStore::should_snapshot`] fires on
    /// every multiple of this.
    pub snapshot_interval: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

/// A materialized state snapshot bounding replay cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The stream this snapshot belongs to.
    pub stream_id: String,
    /// The snapshot covers events up to and including this sequence.
    pub through_sequence: u64,
    /// Materialized state.
    pub state: serde_json::Value,
    /// When the snapshot was taken, Unix millis.
    pub taken_at_ms: u64,
}

#[derive(Default)]
struct StreamInner {
    events: Vec<Event>,
    snapshots: Vec<Snapshot>,
}

/// In-memory append-only event store.
pub struct EventStore {
    /// Per-stream state behind its own lock; the outer map is only locked
    /// to find or create a stream.
    streams: RwLock<HashMap<String, Arc<Mutex<StreamInner>>>>,
    config: EventStoreConfig,
}

impl EventStore {
    /// Create a store with default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EventStoreConfig::default())
    }

    /// Create a store with explicit config.
    #[must_use]
    pub fn with_config(config: EventStoreConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Append an event to a stream, assigning the next sequence number.
    ///
    /// Atomic per stream: the sequence is assigned and the event stored
    /// under the same exclusive section.
    pub fn append(&self, stream_id: &str, mut event: Event) -> u64 {
        let stream = self.stream_for(stream_id);
        let mut inner = stream.lock();

        let sequence_no = inner.events.len() as u64 + 1;
        event.stream_id = stream_id.to_string();
        event.sequence_no = sequence_no;
        debug!(stream = %stream_id, seq = sequence_no, name = %event.event_name, "Event appended");
        inner.events.push(event);
        sequence_no
    }

    /// Read events from `from_seq` (inclusive) onward, in order.
    /// Restartable from any point.
    #[must_use]
    pub fn read(&self, stream_id: &str, from_seq: u64) -> Vec<Event> {
        let Some(stream) = self.streams.read().get(stream_id).cloned() else {
            return Vec::new();
        };
        let inner = stream.lock();
        let skip = usize::try_from(from_seq.saturating_sub(1)).unwrap_or(usize::MAX);
        inner.events.iter().skip(skip).cloned().collect()
    }

    /// Highest sequence number in a stream (0 for an unknown stream).
    #[must_use]
    pub fn stream_version(&self, stream_id: &str) -> u64 {
        self.streams
            .read()
            .get(stream_id)
            .map_or(0, |s| s.lock().events.len() as u64)
    }

    /// Record a materialized snapshot covering events up to
    /// `through_sequence`.
    pub fn record_snapshot(&self, stream_id: &str, through_sequence: u64, state: serde_json::Value) {
        let stream = self.stream_for(stream_id);
        stream.lock().snapshots.push(Snapshot {
            stream_id: stream_id.to_string(),
            through_sequence,
            state,
            taken_at_ms: now_ms(),
        });
    }

    /// The latest snapshot at or before `at_most_seq`, if any.
    #[must_use]
    pub fn latest_snapshot(&self, stream_id: &str, at_most_seq: u64) -> Option<Snapshot> {
        let stream = self.streams.read().get(stream_id).cloned()?;
        let inner = stream.lock();
        inner
            .snapshots
            .iter()
            .filter(|s| s.through_sequence <= at_most_seq)
            .max_by_key(|s| s.through_sequence)
            .cloned()
    }

    /// Rebuild a projection at `at_seq`: start from the latest snapshot at
    /// or before that point, then fold subsequent events in order.
    pub fn replay<S, F>(&self, stream_id: &str, at_seq: u64, initial: S, mut apply: F) -> S
    where
        F: FnMut(S, &Event) -> S,
        S: From<serde_json::Value>,
    {
        let (mut state, resume_from) = match self.latest_snapshot(stream_id, at_seq) {
            Some(snapshot) => (S::from(snapshot.state), snapshot.through_sequence + 1),
            None => (initial, 1),
        };
        for event in self.read(stream_id, resume_from) {
            if event.sequence_no > at_seq {
                break;
            }
            state = apply(state, &event);
        }
        state
    }

    /// True when `sequence_no` lands on the snapshot cadence.
    #[must_use]
    pub fn should_snapshot(&self, sequence_no: u64) -> bool {
        self.config.snapshot_interval > 0 && sequence_no % self.config.snapshot_interval == 0
    }

    fn stream_for(&self, stream_id: &str) -> Arc<Mutex<StreamInner>> {
        if let Some(existing) = self.streams.read().get(stream_id) {
            return existing.clone();
        }
        self.streams
            .write()
            .entry(stream_id.to_string())
            .or_default()
            .clone()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}
