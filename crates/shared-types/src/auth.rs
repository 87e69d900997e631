//! # Auth Context and Permissions
//!
//! The communication core does not authenticate anyone itself. An external
//! collaborator resolves a caller token into an [`AuthContext`]; the facade
//! fails closed when no context is supplied.

use crate::module::ModuleId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single named permission (e.g. `"orders.write"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission(String);

impl Permission {
    /// Create a permission from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw permission name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Permission {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An unordered set of permissions with superset checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Create an empty permission set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an iterator of permission names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Permission::new).collect())
    }

    /// Add a permission.
    pub fn insert(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    /// Check membership of a single permission.
    #[must_use]
    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    /// True if `self` grants every permission in `required`.
    #[must_use]
    pub fn is_superset(&self, required: &Self) -> bool {
        required.0.is_subset(&self.0)
    }

    /// Permissions in `required` that are missing from `self`.
    #[must_use]
    pub fn missing_from(&self, required: &Self) -> Vec<Permission> {
        required.0.difference(&self.0).cloned().collect()
    }

    /// Number of permissions in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    /// A module calling on its own behalf.
    Module(ModuleId),
    /// A human operator or end user.
    User(String),
}

/// Authenticated caller identity plus granted permissions.
///
/// Produced by the external auth provider; treated as opaque by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Who is calling.
    pub principal: Principal,
    /// What the caller is allowed to do.
    pub permissions: PermissionSet,
}

impl AuthContext {
    /// Context for a module caller.
    pub fn for_module(id: ModuleId, permissions: PermissionSet) -> Self {
        Self {
            principal: Principal::Module(id),
            permissions,
        }
    }

    /// Context for a user caller.
    pub fn for_user(user_id: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            principal: Principal::User(user_id.into()),
            permissions,
        }
    }
}

/// Contract for the external auth collaborator.
///
/// Given an opaque token, resolve the caller's identity and permissions.
/// `None` means the token is invalid or expired; the facade fails closed.
#[async_trait]
pub trait AuthContextProvider: Send + Sync {
    /// Resolve a token into an auth context, or `None` if invalid.
    async fn resolve(&self, token: &str) -> Option<AuthContext>;
}
