//! # Error Taxonomy
//!
//! The typed results callers receive from the communication core. Transient
//! kinds are retried internally; permanent kinds surface immediately.

use crate::module::ModuleId;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the communication core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommsError {
    /// Caller lacks the permissions required by the target. Never retried.
    #[error("authorization denied for {principal}: missing {missing:?}")]
    AuthorizationDenied {
        /// The denied caller.
        principal: String,
        /// Permissions the caller lacks.
        missing: Vec<String>,
    },

    /// Circuit breaker for the target is open. Fail fast, no queue attempt.
    #[error("target {module} unavailable: circuit open")]
    TargetUnavailable {
        /// The unreachable module.
        module: ModuleId,
    },

    /// The caller-visible wait elapsed. The message may still be retried
    /// internally up to its attempt budget.
    #[error("delivery timed out after {timeout_ms}ms (message {message_id})")]
    DeliveryTimeout {
        /// The message that timed out.
        message_id: Uuid,
        /// The wait that elapsed.
        timeout_ms: u64,
    },

    /// The target handler failed. Retried per backoff policy.
    #[error("handler failure in {module}: {reason}")]
    HandlerFailure {
        /// The failing module.
        module: ModuleId,
        /// Handler-reported reason.
        reason: String,
    },

    /// The message exhausted all delivery attempts. Terminal.
    #[error("message {message_id} dead-lettered after {attempts} attempts")]
    DeadLettered {
        /// The dead-lettered message.
        message_id: Uuid,
        /// Attempts made.
        attempts: u32,
    },

    /// Payload does not match the capability's declared schema. Never retried.
    #[error("schema validation failed: {reason}")]
    SchemaValidationFailure {
        /// What failed to validate.
        reason: String,
    },

    /// A workflow step failed terminally, marking the execution failed.
    #[error("workflow step {step_id} failed in execution {execution_id}: {reason}")]
    WorkflowStepFailure {
        /// The failed execution.
        execution_id: Uuid,
        /// The step that exhausted its retries.
        step_id: String,
        /// Failure reason.
        reason: String,
    },

    /// The addressed module has no registered handler.
    #[error("no handler registered for module {module}")]
    NoHandler {
        /// The unaddressable module.
        module: ModuleId,
    },

    /// The delivery queue is at capacity.
    #[error("delivery queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity that was hit.
        capacity: usize,
    },
}

impl CommsError {
    /// True for errors the bus retries internally; false for errors that
    /// surface to the caller immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DeliveryTimeout { .. } | Self::HandlerFailure { .. }
        )
    }
}
