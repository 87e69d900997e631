//! # Cross-Crate Adapters
//!
//! The bus, discovery, and event crates deliberately do not depend on each
//! other; their seams are traits. This module provides the production
//! implementations that close those seams over the live [`MessageBus`].

use async_trait::async_trait;
use lattice_bus::MessageBus;
use lattice_discovery::FailureRateSource;
use lattice_events::StepDispatcher;
use shared_types::{CommsError, Message, ModuleId};
use std::sync::Arc;

/// Feeds observed bus failure rates into discovery ranking.
pub struct BusFailureRates {
    bus: Arc<MessageBus>,
}

impl BusFailureRates {
    /// Wrap a bus handle.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

impl FailureRateSource for BusFailureRates {
    fn failure_rate(&self, module: &ModuleId) -> f64 {
        self.bus.failure_rate(module)
    }
}

/// Dispatches workflow steps as request-response messages on the bus.
///
/// Step messages carry the workflow engine as their source module so
/// handlers can distinguish orchestrated calls in their logs.
pub struct BusStepDispatcher {
    bus: Arc<MessageBus>,
    source: ModuleId,
}

impl BusStepDispatcher {
    /// Wrap a bus handle.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            source: ModuleId::new("workflow-engine"),
        }
    }
}

#[async_trait]
impl StepDispatcher for BusStepDispatcher {
    async fn dispatch(
        &self,
        module: &ModuleId,
        action: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, CommsError> {
        let message = Message::request(self.source.clone(), module.clone(), action, input);
        self.bus.send(message).await
    }
}
