//! # Capabilities
//!
//! A capability is a named, versioned unit of functionality a module
//! advertises. The discovery service holds a non-owning index of these;
//! the advertising module owns the lifecycle.

use serde::{Deserialize, Serialize};
use shared_types::{ModuleId, PermissionSet};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a version string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid version {input:?}: expected MAJOR.MINOR.PATCH")]
pub struct VersionParseError {
    /// The rejected input.
    pub input: String,
}

/// Semantic version triple for capability matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapabilityVersion {
    /// Breaking-change counter.
    pub major: u64,
    /// Feature counter.
    pub minor: u64,
    /// Fix counter.
    pub patch: u64,
}

impl CapabilityVersion {
    /// Construct a version.
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Caret-style compatibility: same major, and at least the requested
    /// minor.patch.
    #[must_use]
    pub fn satisfies_caret(&self, min: &Self) -> bool {
        self.major == min.major && (self.minor, self.patch) >= (min.minor, min.patch)
    }
}

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for CapabilityVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError {
            input: s.to_string(),
        };
        let mut parts = s.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let patch = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self::new(major, minor, patch))
    }
}

/// A capability advertised by a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Unique within the owning module.
    pub capability_id: String,
    /// The advertising module.
    pub owning_module: ModuleId,
    /// Human-readable name.
    pub name: String,
    /// Type used for exact-match queries (e.g. `"payment-processor"`).
    pub capability_type: String,
    /// Advertised version.
    pub version: CapabilityVersion,
    /// Expected request shape: `{"field": "type"}` with JSON type names.
    pub input_schema: serde_json::Value,
    /// Promised response shape, same convention.
    pub output_schema: serde_json::Value,
    /// Permissions a caller must hold to use this capability.
    pub required_permissions: PermissionSet,
    /// Tags for subset-match queries.
    pub tags: BTreeSet<String>,
    /// Whether the capability currently accepts traffic.
    pub is_available: bool,
    /// When the capability was (re-)advertised, Unix millis. Set by the
    /// discovery service.
    pub advertised_at_ms: u64,
}

impl Capability {
    /// Create an available capability with empty schemas and no tags.
    pub fn new(
        capability_id: impl Into<String>,
        owning_module: ModuleId,
        capability_type: impl Into<String>,
        version: CapabilityVersion,
    ) -> Self {
        let capability_id = capability_id.into();
        Self {
            name: capability_id.clone(),
            capability_id,
            owning_module,
            capability_type: capability_type.into(),
            version,
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
            required_permissions: PermissionSet::new(),
            tags: BTreeSet::new(),
            is_available: true,
            advertised_at_ms: 0,
        }
    }

    /// Set tags (builder style).
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set required permissions (builder style).
    #[must_use]
    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.required_permissions = permissions;
        self
    }

    /// Set the input schema (builder style).
    #[must_use]
    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set the output schema (builder style).
    #[must_use]
    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = schema;
        self
    }
}

/// Structurally validate a payload against a capability schema.
///
/// The schema is an object mapping required top-level field names to JSON
/// type names (`"string"`, `"number"`, `"boolean"`, `"object"`, `"array"`,
/// `"any"`). A `Null` schema accepts anything.
///
/// # Errors
///
/// A human-readable description of the first mismatch.
pub fn validate_payload(schema: &serde_json::Value, payload: &serde_json::Value) -> Result<(), String> {
    let serde_json::Value::Object(fields) = schema else {
        return Ok(());
    };
    let serde_json::Value::Object(body) = payload else {
        return Err("payload must be a JSON object".to_string());
    };

    for (field, expected) in fields {
        let Some(value) = body.get(field) else {
            return Err(format!("missing required field {field:?}"));
        };
        let expected = expected.as_str().unwrap_or("any");
        let actual = json_type_name(value);
        if expected != "any" && expected != actual {
            return Err(format!(
                "field {field:?} expected {expected}, got {actual}"
            ));
        }
    }
    Ok(())
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
