//! # Lattice Discovery - Capability Advertisement and Negotiation
//!
//! Modules advertise versioned capabilities; callers query for "which module
//! implements capability X" and negotiate a contract before addressing
//! messages. Independent of the message bus.
//!
//! ## Matching Rules
//!
//! - `capability_type` matches exactly.
//! - Query tags must be a subset of the capability's tags.
//! - Versions match caret-style: same major, at least the requested
//!   minor.patch.
//!
//! Ties are broken by highest version, then lowest observed failure rate
//! (sourced from bus metrics), then advertisement recency.
//!
//! ## Caching
//!
//! Query results are cached for a short TTL keyed by query signature, and
//! invalidated immediately on any advertise/withdraw for the affected
//! capability type.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cache;
pub mod capability;
pub mod query;
pub mod service;

// Re-export main types
pub use cache::QueryCache;
pub use capability::{validate_payload, Capability, CapabilityVersion, VersionParseError};
pub use query::{CapabilityMatch, DiscoveryQuery};
pub use service::{
    CapabilityContract, DiscoveryConfig, DiscoveryService, FailureRateSource, NegotiationOutcome,
};

/// Default TTL for cached query results.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 5;
