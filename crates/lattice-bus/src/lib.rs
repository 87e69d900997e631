//! # Lattice Bus - Prioritized Inter-Module Message Delivery
//!
//! At-least-once delivery of point-to-point and broadcast messages between
//! named modules, with retry, circuit-breaker, and dead-letter handling.
//!
//! ## Delivery Pipeline
//!
//! ```text
//! ┌──────────┐  send / publish   ┌───────────────┐   workers    ┌──────────┐
//! │  Caller  │ ────────────────▶ │ Priority Queue│ ───────────▶ │ Handler  │
//! └──────────┘                   └───────────────┘              └──────────┘
//!       ▲                               ▲                            │
//!       │ correlated response           │ requeue w/ backoff         │
//!       └───────────────────────────────┴───── failure ◀────────────┘
//!                                       │
//!                                       ▼ attempts exhausted
//!                                 ┌───────────┐
//!                                 │ Dead-Letter│
//!                                 └───────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Priority-then-FIFO ordering within a `(source, target)` pair.
//! - While a breaker is open, no dispatch except the single half-open probe.
//! - `attempt_count` never exceeds `max_attempts`; exhaustion is terminal.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod breaker;
pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod queue;

// Re-export main types
pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker, DispatchDecision};
pub use bus::{BusEvent, BusMetricsSnapshot, MessageBus};
pub use config::BusConfig;
pub use dead_letter::{DeadLetterQueue, DeadLetterRecord};
pub use queue::DeliveryQueue;

/// Default global concurrency ceiling for delivery workers.
pub const DEFAULT_WORKER_CEILING: usize = 256;

/// Default per-priority queue capacity before backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
