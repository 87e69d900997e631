//! # Lattice Test Suite
//!
//! Unified test crate for cross-crate scenarios.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/      # Cross-crate choreography through the facade
//!     ├── messaging.rs  # Delivery, retries, breakers, dead letters
//!     ├── discovery.rs  # Capability matching, ranking, negotiation
//!     └── workflows.rs  # Event sourcing and crash recovery
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p lattice-tests
//!
//! # By area
//! cargo test -p lattice-tests integration::messaging::
//! cargo test -p lattice-tests integration::workflows::
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
