//! # Lattice Events - Event Store, Event Bus, and Workflow Engine
//!
//! The event-sourcing half of the communication core:
//!
//! - [`store`]: append-only per-stream event log with gapless sequence
//!   numbers and snapshot support for bounded replay.
//! - [`bus`]: in-process domain event bus with filtered subscriptions.
//! - [`workflow`]: a workflow engine whose executions are themselves
//!   event-sourced, making them crash-recoverable by replay.
//!
//! ## Ordering
//!
//! Sequence numbers are strictly increasing and gapless per stream; the
//! per-stream append section is the only place contention can serialize
//! callers. There is no ordering relationship across streams.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod bus;
pub mod event;
pub mod store;
pub mod workflow;

// Re-export main types
pub use bus::{DomainEventBus, EventFilter, EventStream, Subscription};
pub use event::Event;
pub use store::{EventStore, EventStoreConfig, Snapshot};
pub use workflow::{
    ExecutionStatus, StepDefinition, StepDispatcher, StepState, WorkflowDefinition, WorkflowEngine,
    WorkflowError, WorkflowExecution,
};

/// Default number of events between snapshots on a stream.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// Maximum events buffered per domain-event subscriber before backpressure.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
