//! # Discovery Queries
//!
//! A query combines any subset of capability type, tags, and a minimum
//! version. The signature keys the query cache.

use crate::capability::{Capability, CapabilityVersion};
use serde::{Deserialize, Serialize};
use shared_types::ModuleId;
use std::collections::BTreeSet;

/// A query against the capability index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    /// Exact capability type to match, if any.
    pub capability_type: Option<String>,
    /// Tags that must all be present on a match.
    pub tags: BTreeSet<String>,
    /// Minimum compatible version (caret semantics), if any.
    pub min_version: Option<CapabilityVersion>,
}

impl DiscoveryQuery {
    /// Query by capability type only.
    pub fn of_type(capability_type: impl Into<String>) -> Self {
        Self {
            capability_type: Some(capability_type.into()),
            ..Self::default()
        }
    }

    /// Require tags (builder style).
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Require a minimum version (builder style).
    #[must_use]
    pub fn with_min_version(mut self, version: CapabilityVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Whether a capability satisfies this query. Unavailable capabilities
    /// never match.
    #[must_use]
    pub fn matches(&self, capability: &Capability) -> bool {
        if !capability.is_available {
            return false;
        }
        if let Some(wanted) = &self.capability_type {
            if *wanted != capability.capability_type {
                return false;
            }
        }
        if !self.tags.is_subset(&capability.tags) {
            return false;
        }
        if let Some(min) = &self.min_version {
            if !capability.version.satisfies_caret(min) {
                return false;
            }
        }
        true
    }

    /// Stable cache key for this query.
    #[must_use]
    pub fn signature(&self) -> String {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        format!(
            "type={}|tags={}|min={}",
            self.capability_type.as_deref().unwrap_or("*"),
            tags.join(","),
            self.min_version
                .map_or_else(|| "*".to_string(), |v| v.to_string()),
        )
    }
}

/// A capability that satisfied a query, with the data used for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMatch {
    /// The offering module.
    pub module_id: ModuleId,
    /// The matched capability.
    pub capability: Capability,
    /// Observed failure rate of the offering module at query time.
    pub failure_rate: f64,
}
