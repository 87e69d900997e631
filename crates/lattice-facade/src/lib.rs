//! # Lattice Facade
//!
//! The single entry point modules use to talk to each other. The facade
//! owns one instance of each subsystem and routes every operation through
//! the security policy before any work is queued.
//!
//! ```text
//!                       ┌──────────────────┐
//!      callers ───────► │   CommsFacade    │
//!                       └────────┬─────────┘
//!              authorize first   │
//!          ┌──────────────┬──────┴───────┬───────────────┐
//!          ▼              ▼              ▼               ▼
//!     MessageBus   DiscoveryService  EventStore    WorkflowEngine
//!                                    + DomainEventBus
//! ```
//!
//! Cross-crate seams are closed here: the bus feeds failure rates to
//! discovery ranking, and workflow steps dispatch through the bus.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod facade;
pub mod policy;

// Re-export main types
pub use adapters::{BusFailureRates, BusStepDispatcher};
pub use facade::{
    CommsFacade, CoreMetricsSnapshot, DeadLetterInspection, FacadeConfig, FacadeError,
};
pub use policy::SecurityPolicy;
