//! # Module Identity and Registry
//!
//! Modules are independently addressable business-capability units. The
//! registry tracks which modules exist and whether they are live; the
//! discovery service treats it as authoritative and purges capabilities
//! for deregistered modules.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// Unique identifier for a module (lower-kebab name, e.g. `"order-service"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    /// Create a module ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Health of a registered module as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleHealth {
    /// Module is running normally.
    Healthy,
    /// Module is running but degraded (e.g. high latency).
    Degraded,
    /// Module has been deregistered or is not running.
    Offline,
}

/// Metadata about a registered module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Unique identifier.
    pub id: ModuleId,
    /// Human-readable name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Current health.
    pub health: ModuleHealth,
}

impl ModuleInfo {
    /// Create info for a healthy module.
    pub fn new(id: ModuleId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: "0.1.0".to_string(),
            health: ModuleHealth::Healthy,
        }
    }
}

/// In-process registry of live modules.
///
/// The communication core consults this registry for liveness only; module
/// lifecycle (deploy, upgrade, retire) is driven by external tooling.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<ModuleId, ModuleInfo>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module. Replaces any existing entry with the same ID.
    pub fn register(&self, info: ModuleInfo) {
        let id = info.id.clone();
        let mut modules = self.modules.write();
        if modules.insert(id.clone(), info).is_some() {
            warn!(module = %id, "Module already registered, replacing");
        } else {
            info!(module = %id, "Module registered");
        }
    }

    /// Deregister a module. Returns the removed entry, if any.
    pub fn deregister(&self, id: &ModuleId) -> Option<ModuleInfo> {
        let removed = self.modules.write().remove(id);
        if removed.is_some() {
            info!(module = %id, "Module deregistered");
        }
        removed
    }

    /// Check whether a module is registered and not offline.
    #[must_use]
    pub fn is_live(&self, id: &ModuleId) -> bool {
        self.modules
            .read()
            .get(id)
            .is_some_and(|m| m.health != ModuleHealth::Offline)
    }

    /// Update the health of a registered module.
    pub fn mark_health(&self, id: &ModuleId, health: ModuleHealth) {
        if let Some(info) = self.modules.write().get_mut(id) {
            info.health = health;
        }
    }

    /// Get info about a registered module.
    #[must_use]
    pub fn info(&self, id: &ModuleId) -> Option<ModuleInfo> {
        self.modules.read().get(id).cloned()
    }

    /// All registered module IDs.
    #[must_use]
    pub fn registered_ids(&self) -> Vec<ModuleId> {
        self.modules.read().keys().cloned().collect()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// True if no modules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
