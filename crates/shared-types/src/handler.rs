//! # Handler Capability Trait
//!
//! Modules expose functionality to the bus by registering a [`Handler`]
//! explicitly. Dispatch is resolved through the handler table, never through
//! reflection or implicit decoration.

use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Error returned by a module handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler ran but failed. Retried by the bus up to the message's
    /// attempt budget.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler rejected the request shape. Never retried.
    #[error("malformed request: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// True if the bus should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// The capability a module registers to receive messages.
///
/// One handler serves all actions addressed to its module; the handler
/// inspects `message.action` to dispatch internally.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process a message and produce a response payload.
    ///
    /// For one-way patterns the returned value is discarded.
    async fn handle(&self, message: Message) -> Result<serde_json::Value, HandlerError>;
}

/// Type-erased handler for the registration table.
pub type DynHandler = std::sync::Arc<dyn Handler>;
