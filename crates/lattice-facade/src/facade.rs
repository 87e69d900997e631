//! # Communication Facade
//!
//! One object owning the whole communication core. Every outward-facing
//! operation authorizes against the [`SecurityPolicy`] before touching the
//! bus, discovery, or the event system; a denied caller never consumes
//! queue capacity.

use crate::adapters::{BusFailureRates, BusStepDispatcher};
use crate::policy::SecurityPolicy;
use lattice_bus::{BusConfig, BusEvent, BusMetricsSnapshot, MessageBus};
use lattice_discovery::{
    validate_payload, Capability, CapabilityContract, CapabilityMatch, DiscoveryConfig,
    DiscoveryQuery, DiscoveryService, NegotiationOutcome,
};
use lattice_events::{
    DomainEventBus, Event, EventFilter, EventStore, EventStoreConfig, Subscription,
    WorkflowDefinition, WorkflowEngine, WorkflowError, WorkflowExecution,
};
use lattice_telemetry::metrics as telemetry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_types::{
    AuthContext, AuthContextProvider, CommsError, DynHandler, Message, ModuleId, ModuleInfo,
    ModuleRegistry,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors surfaced by facade operations.
#[derive(Debug, Error)]
pub enum FacadeError {
    /// A communication error from the bus, discovery, or policy layer.
    #[error(transparent)]
    Comms(#[from] CommsError),

    /// A workflow engine error.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Top-level configuration for the communication core.
#[derive(Debug, Clone, Default)]
pub struct FacadeConfig {
    /// Message bus tunables.
    pub bus: BusConfig,
    /// Discovery tunables.
    pub discovery: DiscoveryConfig,
    /// Event store tunables.
    pub events: EventStoreConfig,
}

impl FacadeConfig {
    /// Read all tunables from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            discovery: DiscoveryConfig::default(),
            events: EventStoreConfig::default(),
        }
    }
}

/// Operator-facing view of one dead-lettered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterInspection {
    /// The dead-lettered message.
    pub message_id: Uuid,
    /// Its target, if it had one.
    pub target: Option<ModuleId>,
    /// The action it carried.
    pub action: String,
    /// Attempts made before parking.
    pub attempts: u32,
    /// Final failure reason.
    pub reason: String,
    /// When it was parked, Unix millis.
    pub dead_lettered_at_ms: u64,
}

/// Combined point-in-time view across all subsystems.
#[derive(Debug, Clone)]
pub struct CoreMetricsSnapshot {
    /// Bus counters and breaker state.
    pub bus: BusMetricsSnapshot,
    /// Modules currently registered.
    pub registered_modules: usize,
    /// Capabilities currently advertised.
    pub capabilities: usize,
    /// Domain events published.
    pub events_published: u64,
    /// Workflow executions started.
    pub workflows_started: u64,
    /// Workflow executions that completed.
    pub workflows_completed: u64,
    /// Workflow executions that failed.
    pub workflows_failed: u64,
}

/// The unified communication core.
pub struct CommsFacade {
    registry: Arc<ModuleRegistry>,
    bus: Arc<MessageBus>,
    discovery: Arc<DiscoveryService>,
    store: Arc<EventStore>,
    event_bus: Arc<DomainEventBus>,
    workflows: Arc<WorkflowEngine>,
    policy: Arc<SecurityPolicy>,
    auth_provider: RwLock<Option<Arc<dyn AuthContextProvider>>>,
}

impl CommsFacade {
    /// Build and start the communication core.
    #[must_use]
    pub fn new(config: FacadeConfig) -> Arc<Self> {
        let bus = Arc::new(MessageBus::new(config.bus));
        bus.start();

        let discovery = Arc::new(DiscoveryService::with_config(
            config.discovery,
            Arc::new(BusFailureRates::new(bus.clone())),
        ));
        let store = Arc::new(EventStore::with_config(config.events));
        let event_bus = Arc::new(DomainEventBus::new());
        let workflows = Arc::new(WorkflowEngine::new(
            store.clone(),
            Arc::new(BusStepDispatcher::new(bus.clone())),
        ));

        info!("Communication core started");
        Arc::new(Self {
            registry: Arc::new(ModuleRegistry::new()),
            bus,
            discovery,
            store,
            event_bus,
            workflows,
            policy: Arc::new(SecurityPolicy::new()),
            auth_provider: RwLock::new(None),
        })
    }

    /// Install the external auth collaborator that resolves caller tokens.
    pub fn set_auth_provider(&self, provider: Arc<dyn AuthContextProvider>) {
        *self.auth_provider.write() = Some(provider);
    }

    /// Resolve a caller token into an [`AuthContext`].
    ///
    /// Fails closed: no configured provider, or a token the provider does
    /// not recognize, is a denial.
    pub async fn authenticate(&self, token: &str) -> Result<AuthContext, FacadeError> {
        let provider = self.auth_provider.read().clone();
        let Some(provider) = provider else {
            return Err(CommsError::AuthorizationDenied {
                principal: "anonymous".to_string(),
                missing: Vec::new(),
            }
            .into());
        };
        match provider.resolve(token).await {
            Some(context) => Ok(context),
            None => Err(CommsError::AuthorizationDenied {
                principal: "anonymous".to_string(),
                missing: Vec::new(),
            }
            .into()),
        }
    }

    /// The security policy, for installing permission rules.
    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// The module registry.
    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The underlying event store, shared with the workflow engine.
    #[must_use]
    pub fn event_store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    // =========================================================================
    // MODULE LIFECYCLE
    // =========================================================================

    /// Register a module and its message handler.
    pub fn register_module(&self, info: ModuleInfo, handler: DynHandler) {
        let module_id = info.id.clone();
        self.registry.register(info);
        self.bus.register_handler(module_id.clone(), handler);
        info!(module = %module_id, "Module registered");
    }

    /// Deregister a module: handler removed, capabilities withdrawn.
    pub fn deregister_module(&self, module: &ModuleId) {
        self.bus.deregister_handler(module);
        self.registry.deregister(module);
        self.discovery.purge_deregistered(&self.registry);
        info!(module = %module, "Module deregistered");
    }

    // =========================================================================
    // MESSAGING
    // =========================================================================

    /// Send a request and wait for the correlated response.
    pub async fn send_request(
        &self,
        auth: &AuthContext,
        message: Message,
    ) -> Result<serde_json::Value, FacadeError> {
        let Some(target) = message.target_module.clone() else {
            return Err(CommsError::SchemaValidationFailure {
                reason: "request message has no target module".to_string(),
            }
            .into());
        };
        self.policy.authorize_send(auth, &target)?;

        telemetry::MESSAGES_SENT
            .with_label_values(&["request_response", message.source_module.as_str()])
            .inc();
        let _timer = telemetry::HistogramTimer::new(&telemetry::DELIVERY_LATENCY);
        let result = self.bus.send(message).await;
        match &result {
            Ok(_) => telemetry::MESSAGES_DELIVERED.inc(),
            Err(e) => {
                telemetry::MESSAGES_FAILED
                    .with_label_values(&[error_kind(e)])
                    .inc();
            }
        }
        Ok(result?)
    }

    /// Send a request against a negotiated contract.
    ///
    /// The payload is validated against the contract's input schema before
    /// anything is queued; a mismatch fails immediately without consuming
    /// the target's attention.
    pub async fn send_via_contract(
        &self,
        auth: &AuthContext,
        source: ModuleId,
        contract: &CapabilityContract,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, FacadeError> {
        validate_payload(&contract.input_schema, &payload)
            .map_err(|reason| CommsError::SchemaValidationFailure { reason })?;

        let message = Message::request(
            source,
            contract.provider.clone(),
            contract.capability_id.clone(),
            payload,
        );
        self.send_request(auth, message).await
    }

    /// Enqueue a fire-and-forget message.
    pub fn send_notification(
        &self,
        auth: &AuthContext,
        message: Message,
    ) -> Result<(), FacadeError> {
        if let Some(target) = &message.target_module {
            self.policy.authorize_send(auth, target)?;
        }
        telemetry::MESSAGES_SENT
            .with_label_values(&["point_to_point", message.source_module.as_str()])
            .inc();
        self.bus.publish(message)?;
        Ok(())
    }

    /// Subscribe to bus failure events (dead-letters, breaker transitions).
    #[must_use]
    pub fn bus_events(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.events()
    }

    /// Dead-letter queue contents for operator inspection.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterInspection> {
        self.bus
            .dead_letters()
            .into_iter()
            .map(|record| DeadLetterInspection {
                message_id: record.message.id,
                target: record.message.target_module,
                action: record.message.action,
                attempts: record.message.attempt_count,
                reason: record.reason,
                dead_lettered_at_ms: record.dead_lettered_at_ms,
            })
            .collect()
    }

    /// Re-enqueue a copy of a dead-lettered message after the underlying
    /// fault is fixed. Returns the new message id.
    pub fn replay_dead_letter(&self, message_id: Uuid) -> Option<Uuid> {
        self.bus.replay_dead_letter(message_id)
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    /// Advertise a capability for a module.
    pub fn advertise_capability(&self, module: ModuleId, capability: Capability) {
        self.discovery.advertise(module, capability);
        #[allow(clippy::cast_precision_loss)]
        telemetry::CAPABILITIES_REGISTERED.set(self.discovery.capability_count() as f64);
    }

    /// Withdraw a previously advertised capability.
    pub fn withdraw_capability(&self, module: &ModuleId, capability_id: &str) {
        self.discovery.withdraw(module, capability_id);
        #[allow(clippy::cast_precision_loss)]
        telemetry::CAPABILITIES_REGISTERED.set(self.discovery.capability_count() as f64);
    }

    /// Find capabilities matching a query, best first.
    #[must_use]
    pub fn discover(&self, query: &DiscoveryQuery) -> Vec<CapabilityMatch> {
        self.discovery.query(query)
    }

    /// Negotiate a contract for the best matching capability the caller is
    /// permitted to use.
    #[must_use]
    pub fn negotiate(&self, auth: &AuthContext, query: &DiscoveryQuery) -> NegotiationOutcome {
        self.discovery.negotiate(auth, query)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Append a domain event to a stream and publish it to subscribers.
    ///
    /// The append happens first; subscribers can always re-read what they
    /// saw. Returns the assigned sequence number.
    pub fn record_event(
        &self,
        auth: &AuthContext,
        stream_id: &str,
        event: Event,
    ) -> Result<u64, FacadeError> {
        self.policy.authorize_publish(auth, &event.event_name)?;

        let sequence_no = self.store.append(stream_id, event.clone());
        telemetry::EVENTS_APPENDED.inc();

        let mut published = event;
        published.stream_id = stream_id.to_string();
        published.sequence_no = sequence_no;
        self.event_bus.publish(published);
        telemetry::EVENTS_PUBLISHED.inc();

        Ok(sequence_no)
    }

    /// Publish a transient domain event without persisting it.
    pub fn publish_event(&self, auth: &AuthContext, event: Event) -> Result<usize, FacadeError> {
        self.policy.authorize_publish(auth, &event.event_name)?;
        telemetry::EVENTS_PUBLISHED.inc();
        Ok(self.event_bus.publish(event))
    }

    /// Subscribe to domain events matching a filter.
    #[must_use]
    pub fn subscribe_to_events(&self, filter: EventFilter) -> Subscription {
        self.event_bus.subscribe(filter)
    }

    /// Read a stream back from the store.
    #[must_use]
    pub fn read_events(&self, stream_id: &str, from_seq: u64) -> Vec<Event> {
        self.store.read(stream_id, from_seq)
    }

    // =========================================================================
    // WORKFLOWS
    // =========================================================================

    /// Register a workflow definition and wire up its triggers.
    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        let has_triggers = !definition.trigger_events.is_empty();
        self.workflows.register_workflow(definition);
        if has_triggers {
            self.workflows.attach_triggers(&self.event_bus);
        }
    }

    /// Start a workflow execution.
    pub fn start_workflow(
        &self,
        auth: &AuthContext,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, FacadeError> {
        self.policy.authorize_workflow(auth, workflow_id)?;
        let execution_id = self.workflows.start_workflow(workflow_id, input)?;
        Ok(execution_id)
    }

    /// Resume an execution after a restart.
    pub fn resume_workflow(&self, execution_id: Uuid) -> Result<(), FacadeError> {
        self.workflows.resume(execution_id)?;
        Ok(())
    }

    /// Current state of an execution.
    #[must_use]
    pub fn execution_status(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.workflows.execution_status(execution_id)
    }

    // =========================================================================
    // OBSERVABILITY
    // =========================================================================

    /// Combined metrics across all subsystems.
    #[must_use]
    pub fn metrics(&self) -> CoreMetricsSnapshot {
        let bus = self.bus.metrics_snapshot();
        #[allow(clippy::cast_precision_loss)]
        {
            telemetry::QUEUE_DEPTH.set(bus.queue_depth as f64);
            telemetry::BREAKERS_OPEN.set(bus.open_breakers.len() as f64);
        }
        CoreMetricsSnapshot {
            bus,
            registered_modules: self.registry.len(),
            capabilities: self.discovery.capability_count(),
            events_published: self.event_bus.events_published(),
            workflows_started: self.workflows.executions_started(),
            workflows_completed: self.workflows.executions_completed(),
            workflows_failed: self.workflows.executions_failed(),
        }
    }

    /// Drain and stop. In-flight deliveries finish.
    pub fn shutdown(&self) {
        warn!("Communication core shutting down");
        self.bus.shutdown();
    }
}

fn error_kind(error: &CommsError) -> &'static str {
    match error {
        CommsError::AuthorizationDenied { .. } => "authorization_denied",
        CommsError::TargetUnavailable { .. } => "target_unavailable",
        CommsError::DeliveryTimeout { .. } => "delivery_timeout",
        CommsError::HandlerFailure { .. } => "handler_failure",
        CommsError::DeadLettered { .. } => "dead_lettered",
        CommsError::SchemaValidationFailure { .. } => "schema_validation",
        CommsError::WorkflowStepFailure { .. } => "workflow_step",
        CommsError::NoHandler { .. } => "no_handler",
        CommsError::QueueFull { .. } => "queue_full",
    }
}
