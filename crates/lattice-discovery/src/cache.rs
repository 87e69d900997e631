//! # TTL Query Cache
//!
//! Query results are cached for a few seconds keyed by query signature,
//! trading a small staleness window for read throughput. Any advertise or
//! withdraw invalidates every entry that could have included the affected
//! capability type. Expired entries are garbage-collected lazily.

use crate::query::CapabilityMatch;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    matches: Vec<CapabilityMatch>,
    /// The query's type filter; `None` means the query spanned all types.
    capability_type: Option<String>,
    inserted_at: Instant,
}

/// TTL-bounded cache of query results.
pub struct QueryCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl QueryCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Look up a fresh entry by query signature.
    #[must_use]
    pub fn get(&self, signature: &str) -> Option<Vec<CapabilityMatch>> {
        let entry = self.entries.get(signature)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.matches.clone())
    }

    /// Store a result. Expired entries are collected on the way in.
    pub fn insert(
        &mut self,
        signature: String,
        capability_type: Option<String>,
        matches: Vec<CapabilityMatch>,
    ) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        self.entries.insert(
            signature,
            CacheEntry {
                matches,
                capability_type,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry whose query could have included `capability_type`:
    /// entries filtered to that exact type, and unfiltered entries.
    pub fn invalidate_type(&mut self, capability_type: &str) {
        self.entries.retain(|_, e| {
            e.capability_type
                .as_deref()
                .is_some_and(|t| t != capability_type)
        });
    }

    /// Number of live entries (expired ones may still be counted until the
    /// next insert).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
