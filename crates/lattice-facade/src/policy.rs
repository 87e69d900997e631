//! # Security Policy
//!
//! Declarative permission requirements checked before any communication
//! happens. Authorization runs against an already-resolved [`AuthContext`];
//! resolving tokens is the external auth provider's job. An operation with
//! no matching rule requires nothing; a caller missing any required
//! permission is denied with the exact missing set.

use parking_lot::RwLock;
use shared_types::{AuthContext, CommsError, ModuleId, PermissionSet, Principal};
use std::collections::HashMap;

/// Printable caller name for error messages.
#[must_use]
pub fn principal_name(auth: &AuthContext) -> String {
    match &auth.principal {
        Principal::Module(id) => format!("module:{id}"),
        Principal::User(name) => format!("user:{name}"),
    }
}

/// Permission requirements for targets and workflows.
#[derive(Default)]
pub struct SecurityPolicy {
    /// Permissions required to address a target module.
    module_rules: RwLock<HashMap<ModuleId, PermissionSet>>,
    /// Permissions required to start a workflow.
    workflow_rules: RwLock<HashMap<String, PermissionSet>>,
    /// Permissions required to publish a named domain event.
    event_rules: RwLock<HashMap<String, PermissionSet>>,
}

impl SecurityPolicy {
    /// Create an empty policy (everything allowed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require permissions to send to a module.
    pub fn require_for_module(&self, module: ModuleId, required: PermissionSet) {
        self.module_rules.write().insert(module, required);
    }

    /// Require permissions to start a workflow.
    pub fn require_for_workflow(&self, workflow_id: impl Into<String>, required: PermissionSet) {
        self.workflow_rules
            .write()
            .insert(workflow_id.into(), required);
    }

    /// Require permissions to publish a named event.
    pub fn require_for_event(&self, event_name: impl Into<String>, required: PermissionSet) {
        self.event_rules.write().insert(event_name.into(), required);
    }

    /// Authorize sending to a target module.
    ///
    /// # Errors
    ///
    /// `CommsError::AuthorizationDenied` listing the missing permissions.
    pub fn authorize_send(&self, auth: &AuthContext, target: &ModuleId) -> Result<(), CommsError> {
        let required = self.module_rules.read().get(target).cloned();
        self.check(auth, required.as_ref())
    }

    /// Authorize starting a workflow.
    pub fn authorize_workflow(
        &self,
        auth: &AuthContext,
        workflow_id: &str,
    ) -> Result<(), CommsError> {
        let required = self.workflow_rules.read().get(workflow_id).cloned();
        self.check(auth, required.as_ref())
    }

    /// Authorize publishing a named event.
    pub fn authorize_publish(
        &self,
        auth: &AuthContext,
        event_name: &str,
    ) -> Result<(), CommsError> {
        let required = self.event_rules.read().get(event_name).cloned();
        self.check(auth, required.as_ref())
    }

    fn check(&self, auth: &AuthContext, required: Option<&PermissionSet>) -> Result<(), CommsError> {
        let Some(required) = required else {
            return Ok(());
        };
        if auth.permissions.is_superset(required) {
            return Ok(());
        }
        let missing = auth
            .permissions
            .missing_from(required)
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        Err(CommsError::AuthorizationDenied {
            principal: principal_name(auth),
            missing,
        })
    }
}
