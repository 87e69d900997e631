//! # Discovery Service
//!
//! Holds the capability index (non-owning, keyed by module), answers
//! queries, and negotiates contracts. The module registry stays
//! authoritative for liveness: [`DiscoveryService::purge_deregistered`]
//! cascades removal of a dead module's capabilities.

use crate::cache::QueryCache;
use crate::capability::Capability;
use crate::query::{CapabilityMatch, DiscoveryQuery};
use crate::DEFAULT_CACHE_TTL_SECS;
use lattice_telemetry::metrics as telemetry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::message::now_ms;
use shared_types::{AuthContext, ModuleId, ModuleRegistry, Permission};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Source of per-module failure rates used for ranking (fed by bus metrics).
pub trait FailureRateSource: Send + Sync {
    /// Observed failure rate for a module in `0.0..=1.0`.
    fn failure_rate(&self, module: &ModuleId) -> f64;
}

/// Rate source that reports zero for everything. Used when no bus metrics
/// are wired in (tests, standalone discovery).
pub struct NoFailureRates;

impl FailureRateSource for NoFailureRates {
    fn failure_rate(&self, _module: &ModuleId) -> f64 {
        0.0
    }
}

/// Discovery tunables.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// TTL for cached query results.
    pub cache_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

/// The contract handed to a requester after successful negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityContract {
    /// The module to address.
    pub provider: ModuleId,
    /// The capability agreed on.
    pub capability_id: String,
    /// The version the provider will serve.
    pub version: String,
    /// Request shape the requester must send.
    pub input_schema: serde_json::Value,
    /// Response shape the provider promises.
    pub output_schema: serde_json::Value,
}

/// Typed result of a negotiation attempt.
#[derive(Debug, Clone)]
pub enum NegotiationOutcome {
    /// A usable contract.
    Agreed(CapabilityContract),
    /// No available capability satisfied the query.
    NotFound,
    /// A capability matched but the requester lacks permissions.
    InsufficientPermissions {
        /// Permissions the requester is missing.
        missing: Vec<Permission>,
    },
}

/// Capability index plus query cache.
pub struct DiscoveryService {
    /// capabilities[module][capability_id]
    capabilities: RwLock<HashMap<ModuleId, HashMap<String, Capability>>>,
    cache: Mutex<QueryCache>,
    failure_rates: Arc<dyn FailureRateSource>,
}

impl DiscoveryService {
    /// Create a service with default config and no failure-rate source.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default(), Arc::new(NoFailureRates))
    }

    /// Create a service with explicit config and rate source.
    #[must_use]
    pub fn with_config(config: DiscoveryConfig, failure_rates: Arc<dyn FailureRateSource>) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            cache: Mutex::new(QueryCache::new(config.cache_ttl)),
            failure_rates,
        }
    }

    /// Advertise a capability for a module. Re-advertising the same
    /// `capability_id` replaces it and refreshes its recency.
    pub fn advertise(&self, module_id: ModuleId, mut capability: Capability) {
        capability.owning_module = module_id.clone();
        capability.advertised_at_ms = now_ms();
        let capability_type = capability.capability_type.clone();

        info!(
            module = %module_id,
            capability = %capability.capability_id,
            version = %capability.version,
            "Capability advertised"
        );
        self.capabilities
            .write()
            .entry(module_id)
            .or_default()
            .insert(capability.capability_id.clone(), capability);

        self.cache.lock().invalidate_type(&capability_type);
    }

    /// Withdraw a capability.
    pub fn withdraw(&self, module_id: &ModuleId, capability_id: &str) {
        let removed = self
            .capabilities
            .write()
            .get_mut(module_id)
            .and_then(|caps| caps.remove(capability_id));

        if let Some(capability) = removed {
            debug!(module = %module_id, capability = %capability_id, "Capability withdrawn");
            self.cache
                .lock()
                .invalidate_type(&capability.capability_type);
        }
    }

    /// Remove every capability owned by modules the registry no longer
    /// considers live.
    pub fn purge_deregistered(&self, registry: &ModuleRegistry) {
        let mut capabilities = self.capabilities.write();
        let dead: Vec<ModuleId> = capabilities
            .keys()
            .filter(|id| !registry.is_live(id))
            .cloned()
            .collect();

        let mut affected_types = Vec::new();
        for module in dead {
            if let Some(caps) = capabilities.remove(&module) {
                info!(module = %module, count = caps.len(), "Purged capabilities of dead module");
                affected_types.extend(caps.into_values().map(|c| c.capability_type));
            }
        }
        drop(capabilities);

        let mut cache = self.cache.lock();
        for capability_type in affected_types {
            cache.invalidate_type(&capability_type);
        }
    }

    /// Answer a query, ranked best-first. Served from the TTL cache when a
    /// fresh entry exists.
    #[must_use]
    pub fn query(&self, query: &DiscoveryQuery) -> Vec<CapabilityMatch> {
        let signature = query.signature();
        if let Some(cached) = self.cache.lock().get(&signature) {
            debug!(signature = %signature, "Query served from cache");
            telemetry::DISCOVERY_CACHE_HITS.inc();
            return cached;
        }
        telemetry::DISCOVERY_CACHE_MISSES.inc();

        let mut matches: Vec<CapabilityMatch> = self
            .capabilities
            .read()
            .iter()
            .flat_map(|(module_id, caps)| {
                caps.values()
                    .filter(|c| query.matches(c))
                    .map(|c| CapabilityMatch {
                        module_id: module_id.clone(),
                        capability: c.clone(),
                        failure_rate: self.failure_rates.failure_rate(module_id),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        matches.sort_by(rank);

        self.cache
            .lock()
            .insert(signature, query.capability_type.clone(), matches.clone());
        matches
    }

    /// Negotiate a contract for the requester.
    ///
    /// Walks matches best-first and returns the first one whose required
    /// permissions the requester holds. Distinguishes "nothing matched"
    /// from "matched but not permitted".
    #[must_use]
    pub fn negotiate(&self, requester: &AuthContext, query: &DiscoveryQuery) -> NegotiationOutcome {
        let matches = self.query(query);
        if matches.is_empty() {
            return NegotiationOutcome::NotFound;
        }

        let mut missing_best: Option<Vec<Permission>> = None;
        for m in matches {
            if requester
                .permissions
                .is_superset(&m.capability.required_permissions)
            {
                return NegotiationOutcome::Agreed(CapabilityContract {
                    provider: m.module_id,
                    capability_id: m.capability.capability_id,
                    version: m.capability.version.to_string(),
                    input_schema: m.capability.input_schema,
                    output_schema: m.capability.output_schema,
                });
            }
            if missing_best.is_none() {
                missing_best = Some(
                    requester
                        .permissions
                        .missing_from(&m.capability.required_permissions),
                );
            }
        }

        NegotiationOutcome::InsufficientPermissions {
            missing: missing_best.unwrap_or_default(),
        }
    }

    /// Number of capabilities currently indexed.
    #[must_use]
    pub fn capability_count(&self) -> usize {
        self.capabilities.read().values().map(HashMap::len).sum()
    }
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

/// Ranking: highest version, then lowest failure rate, then most recent
/// advertisement.
fn rank(a: &CapabilityMatch, b: &CapabilityMatch) -> Ordering {
    b.capability
        .version
        .cmp(&a.capability.version)
        .then_with(|| {
            a.failure_rate
                .partial_cmp(&b.failure_rate)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.capability.advertised_at_ms.cmp(&a.capability.advertised_at_ms))
}
