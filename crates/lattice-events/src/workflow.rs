//! # Workflow Engine
//!
//! Multi-step workflows whose executions are event-sourced: every state
//! transition is an appended event, and the current state of an execution
//! is a fold over its stream. Recovery after a crash is therefore replay,
//! not repair; completed steps are never re-dispatched.
//!
//! ## Execution lifecycle
//!
//! ```text
//!   start_workflow
//!        │ append workflow.execution.started
//!        ▼
//!   ┌─ for each step (dependencies first) ─────────────┐
//!   │  append workflow.step.running                    │
//!   │  dispatch to handler module (bounded attempts)   │
//!   │  append workflow.step.completed / .failed        │
//!   └──────────────────────────────────────────────────┘
//!        │
//!        ▼
//!   append workflow.execution.completed / .failed
//! ```
//!
//! The engine drives steps through a [`StepDispatcher`] seam rather than
//! calling the message bus directly, so this crate stays independent of
//! the transport.

use crate::bus::{DomainEventBus, EventFilter};
use crate::event::Event;
use crate::store::EventStore;
use async_trait::async_trait;
use lattice_telemetry::metrics as telemetry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_types::{CommsError, ModuleId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default attempts per step before the step fails.
pub const DEFAULT_STEP_ATTEMPTS: u32 = 3;

/// Default per-attempt step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from workflow operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// No workflow registered under this ID.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// No execution stream exists for this ID.
    #[error("Unknown execution: {0}")]
    UnknownExecution(Uuid),
}

/// Seam through which the engine invokes step handlers.
///
/// The production implementation routes through the message bus; tests
/// substitute counting or failing dispatchers.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    /// Invoke `action` on `module` with the resolved step input.
    async fn dispatch(
        &self,
        module: &ModuleId,
        action: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, CommsError>;
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub step_id: String,
    /// Module that handles this step.
    pub handler_module: ModuleId,
    /// Action dispatched to the handler module.
    pub action: String,
    /// Step IDs that must complete before this step runs.
    pub depends_on: Vec<String>,
    /// Static input for the step; dependency outputs are attached under
    /// a `context` key at dispatch time.
    pub input: serde_json::Value,
    /// Attempts before the step fails.
    pub max_attempts: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl StepDefinition {
    /// Create a step with default attempts and timeout.
    pub fn new(
        step_id: impl Into<String>,
        handler_module: impl Into<ModuleId>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            handler_module: handler_module.into(),
            action: action.into(),
            depends_on: Vec::new(),
            input: json!({}),
            max_attempts: DEFAULT_STEP_ATTEMPTS,
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Require other steps to complete first (builder style).
    #[must_use]
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the static step input (builder style).
    #[must_use]
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Set the attempt budget (builder style).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// A registered workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow ID.
    pub workflow_id: String,
    /// Definition version, bumped on change.
    pub version: u32,
    /// Domain event names that start this workflow automatically.
    pub trigger_events: Vec<String>,
    /// Steps in definition order; dependencies must appear earlier.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Create an empty workflow definition.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: 1,
            trigger_events: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Add a step (builder style).
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Start this workflow when any of these events is published
    /// (builder style).
    #[must_use]
    pub fn triggered_by<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_events = events.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Not yet dispatched.
    Pending,
    /// Dispatched, outcome unknown.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempt budget.
    Failed,
}

/// Overall execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Steps still outstanding.
    Running,
    /// All steps completed.
    Completed,
    /// A step failed; later steps were not run.
    Failed,
}

/// Materialized state of one workflow execution, rebuilt from its
/// event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique execution ID.
    pub execution_id: Uuid,
    /// The workflow this execution runs.
    pub workflow_id: String,
    /// Overall state.
    pub status: ExecutionStatus,
    /// State per step ID.
    pub step_states: HashMap<String, StepState>,
    /// Accumulated outputs, keyed `step:{step_id}:output`, plus the
    /// original input under `workflow:input`.
    pub context: HashMap<String, serde_json::Value>,
    /// When the execution started, Unix millis.
    pub started_at_ms: u64,
    /// When it reached a terminal state, if it has.
    pub finished_at_ms: Option<u64>,
}

impl WorkflowExecution {
    fn apply(&mut self, event: &Event) {
        match event.event_name.as_str() {
            "workflow.step.running" => {
                if let Some(step_id) = event.payload["step_id"].as_str() {
                    self.step_states
                        .insert(step_id.to_string(), StepState::Running);
                }
            }
            "workflow.step.completed" => {
                if let Some(step_id) = event.payload["step_id"].as_str() {
                    self.step_states
                        .insert(step_id.to_string(), StepState::Completed);
                    self.context.insert(
                        format!("step:{step_id}:output"),
                        event.payload["output"].clone(),
                    );
                }
            }
            "workflow.step.failed" => {
                if let Some(step_id) = event.payload["step_id"].as_str() {
                    self.step_states
                        .insert(step_id.to_string(), StepState::Failed);
                }
            }
            "workflow.execution.completed" => {
                self.status = ExecutionStatus::Completed;
                self.finished_at_ms = Some(event.occurred_at_ms);
            }
            "workflow.execution.failed" => {
                self.status = ExecutionStatus::Failed;
                self.finished_at_ms = Some(event.occurred_at_ms);
            }
            _ => {}
        }
    }
}

/// Stream ID for an execution's event stream.
#[must_use]
pub fn execution_stream_id(execution_id: &Uuid) -> String {
    format!("workflow-{execution_id}")
}

/// Execution counters, exposed for metrics snapshots.
#[derive(Default)]
struct EngineCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Event-sourced workflow engine.
pub struct WorkflowEngine {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    store: Arc<EventStore>,
    dispatcher: Arc<dyn StepDispatcher>,
    counters: EngineCounters,
    triggers_attached: AtomicBool,
}

impl WorkflowEngine {
    /// Create an engine over a store and a dispatcher.
    pub fn new(store: Arc<EventStore>, dispatcher: Arc<dyn StepDispatcher>) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            store,
            dispatcher,
            counters: EngineCounters::default(),
            triggers_attached: AtomicBool::new(false),
        }
    }

    /// Executions started by this engine instance.
    #[must_use]
    pub fn executions_started(&self) -> u64 {
        self.counters.started.load(Ordering::Relaxed)
    }

    /// Executions that reached `Completed` on this engine instance.
    #[must_use]
    pub fn executions_completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Executions that reached `Failed` on this engine instance.
    #[must_use]
    pub fn executions_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Register (or replace) a workflow definition.
    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        info!(
            workflow = %definition.workflow_id,
            version = definition.version,
            steps = definition.steps.len(),
            "Workflow registered"
        );
        self.workflows
            .write()
            .insert(definition.workflow_id.clone(), definition);
    }

    /// Registered workflow IDs.
    #[must_use]
    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    /// Start an execution of a registered workflow.
    ///
    /// Appends the start event, then drives the steps on a background
    /// task. Returns the execution ID immediately.
    pub fn start_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, WorkflowError> {
        let definition = self
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;

        let execution_id = Uuid::new_v4();
        let stream = execution_stream_id(&execution_id);
        self.store.append(
            &stream,
            Event::new(
                "workflow.execution.started",
                json!({
                    "workflow_id": definition.workflow_id,
                    "version": definition.version,
                    "execution_id": execution_id,
                    "input": input,
                }),
            ),
        );
        info!(workflow = %workflow_id, execution = %execution_id, "Workflow started");
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        telemetry::WORKFLOWS_STARTED.inc();

        let mut context = HashMap::new();
        context.insert("workflow:input".to_string(), input);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(execution_id, definition, context, HashMap::new()).await;
        });

        Ok(execution_id)
    }

    /// Resume an execution after a restart.
    ///
    /// Replays the execution's stream; if it never reached a terminal
    /// state, the remaining steps are re-driven. Completed steps are not
    /// re-dispatched; a step that was mid-flight goes back to pending and
    /// is dispatched again.
    pub fn resume(self: &Arc<Self>, execution_id: Uuid) -> Result<ExecutionStatus, WorkflowError> {
        let execution = self
            .rebuild(execution_id)
            .ok_or(WorkflowError::UnknownExecution(execution_id))?;

        if execution.status != ExecutionStatus::Running {
            return Ok(execution.status);
        }

        let definition = self
            .workflows
            .read()
            .get(&execution.workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(execution.workflow_id.clone()))?;

        let mut step_states = execution.step_states;
        for state in step_states.values_mut() {
            if *state == StepState::Running {
                *state = StepState::Pending;
            }
        }

        info!(execution = %execution_id, "Resuming workflow execution");
        let engine = self.clone();
        let context = execution.context;
        tokio::spawn(async move {
            engine.drive(execution_id, definition, context, step_states).await;
        });

        Ok(ExecutionStatus::Running)
    }

    /// Current state of an execution, rebuilt from its stream.
    #[must_use]
    pub fn execution_status(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.rebuild(execution_id)
    }

    /// Subscribe to the domain event bus and start workflows whose
    /// trigger events fire. Runs until the bus is dropped.
    ///
    /// Idempotent: the listener is spawned at most once per engine, and it
    /// consults the live workflow map per event, so workflows registered
    /// after attachment trigger too. One trigger event starts exactly one
    /// execution per matching workflow.
    pub fn attach_triggers(self: &Arc<Self>, bus: &DomainEventBus) {
        if self.triggers_attached.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut subscription = bus.subscribe(EventFilter::all());
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let workflow_ids: Vec<String> = engine
                    .workflows
                    .read()
                    .values()
                    .filter(|w| w.trigger_events.contains(&event.event_name))
                    .map(|w| w.workflow_id.clone())
                    .collect();
                for workflow_id in workflow_ids {
                    debug!(workflow = %workflow_id, trigger = %event.event_name, "Trigger fired");
                    if let Err(e) = engine.start_workflow(&workflow_id, event.payload.clone()) {
                        warn!(workflow = %workflow_id, error = %e, "Trigger start failed");
                    }
                }
            }
        });
    }

    /// Drive an execution's outstanding steps to a terminal state.
    async fn drive(
        self: Arc<Self>,
        execution_id: Uuid,
        definition: WorkflowDefinition,
        mut context: HashMap<String, serde_json::Value>,
        mut step_states: HashMap<String, StepState>,
    ) {
        let stream = execution_stream_id(&execution_id);

        for step in &definition.steps {
            if step_states.get(&step.step_id) == Some(&StepState::Completed) {
                continue;
            }

            // Steps run strictly after their dependencies; a missing
            // dependency entry means it never completed.
            let deps_met = step
                .depends_on
                .iter()
                .all(|dep| step_states.get(dep) == Some(&StepState::Completed));
            if !deps_met {
                warn!(
                    execution = %execution_id,
                    step = %step.step_id,
                    "Step dependencies unmet, failing execution"
                );
                self.append(&stream, Event::new(
                    "workflow.execution.failed",
                    json!({ "failed_step": step.step_id, "reason": "dependencies unmet" }),
                ));
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                telemetry::WORKFLOWS_FINISHED.with_label_values(&["failed"]).inc();
                return;
            }

            match self.run_step(&stream, execution_id, step, &context).await {
                Ok(output) => {
                    step_states.insert(step.step_id.clone(), StepState::Completed);
                    context.insert(format!("step:{}:output", step.step_id), output);
                }
                Err(e) => {
                    step_states.insert(step.step_id.clone(), StepState::Failed);
                    error!(
                        execution = %execution_id,
                        step = %step.step_id,
                        error = %e,
                        "Step failed, execution failed"
                    );
                    self.append(&stream, Event::new(
                        "workflow.execution.failed",
                        json!({ "failed_step": step.step_id, "reason": e.to_string() }),
                    ));
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    telemetry::WORKFLOWS_FINISHED.with_label_values(&["failed"]).inc();
                    return;
                }
            }
        }

        info!(execution = %execution_id, workflow = %definition.workflow_id, "Workflow completed");
        self.append(
            &stream,
            Event::new("workflow.execution.completed", json!({})),
        );
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        telemetry::WORKFLOWS_FINISHED.with_label_values(&["completed"]).inc();
    }

    /// Run one step through its attempt budget.
    async fn run_step(
        &self,
        stream: &str,
        execution_id: Uuid,
        step: &StepDefinition,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, CommsError> {
        let input = json!({
            "input": step.input,
            "context": context,
        });
        let _step_timer = telemetry::HistogramTimer::new(&telemetry::STEP_DURATION);

        let mut last_error = CommsError::WorkflowStepFailure {
            execution_id,
            step_id: step.step_id.clone(),
            reason: "no attempts made".to_string(),
        };

        for attempt in 1..=step.max_attempts.max(1) {
            self.append(stream, Event::new(
                "workflow.step.running",
                json!({ "step_id": step.step_id, "attempt": attempt }),
            ));

            let dispatched = tokio::time::timeout(
                step.timeout,
                self.dispatcher
                    .dispatch(&step.handler_module, &step.action, input.clone()),
            )
            .await;

            let outcome = match dispatched {
                Ok(result) => result,
                Err(_) => Err(CommsError::DeliveryTimeout {
                    message_id: execution_id,
                    timeout_ms: u64::try_from(step.timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };

            match outcome {
                Ok(output) => {
                    self.append(stream, Event::new(
                        "workflow.step.completed",
                        json!({ "step_id": step.step_id, "output": output, "attempt": attempt }),
                    ));
                    return Ok(output);
                }
                Err(e) => {
                    debug!(
                        step = %step.step_id,
                        attempt,
                        error = %e,
                        "Step attempt failed"
                    );
                    let transient = e.is_transient();
                    last_error = e;
                    if !transient {
                        break;
                    }
                }
            }
        }

        self.append(stream, Event::new(
            "workflow.step.failed",
            json!({ "step_id": step.step_id, "reason": last_error.to_string() }),
        ));
        Err(last_error)
    }

    /// Append a transition event and take a snapshot on the cadence.
    fn append(&self, stream: &str, event: Event) {
        let seq = self.store.append(stream, event);
        if self.store.should_snapshot(seq) {
            if let Some(execution) = self.rebuild_from_stream(stream) {
                if let Ok(state) = serde_json::to_value(&execution) {
                    self.store.record_snapshot(stream, seq, state);
                }
            }
        }
    }

    fn rebuild(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.rebuild_from_stream(&execution_stream_id(&execution_id))
    }

    fn rebuild_from_stream(&self, stream: &str) -> Option<WorkflowExecution> {
        let version = self.store.stream_version(stream);
        if version == 0 {
            return None;
        }

        let (mut execution, from_seq) = match self.store.latest_snapshot(stream, version) {
            Some(snapshot) => match serde_json::from_value::<WorkflowExecution>(snapshot.state) {
                Ok(state) => (Some(state), snapshot.through_sequence + 1),
                Err(_) => (None, 1),
            },
            None => (None, 1),
        };

        for event in self.store.read(stream, from_seq) {
            if event.event_name == "workflow.execution.started" {
                execution = Some(self.execution_from_start(&event));
            } else if let Some(state) = execution.as_mut() {
                state.apply(&event);
            }
        }
        execution
    }

    fn execution_from_start(&self, event: &Event) -> WorkflowExecution {
        let workflow_id = event.payload["workflow_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let execution_id = event.payload["execution_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_default();

        // Unknown definitions still replay; their step map starts empty.
        let step_states = self.workflows.read().get(&workflow_id).map_or_else(
            HashMap::new,
            |def| {
                def.steps
                    .iter()
                    .map(|s| (s.step_id.clone(), StepState::Pending))
                    .collect()
            },
        );

        let mut context = HashMap::new();
        context.insert("workflow:input".to_string(), event.payload["input"].clone());

        WorkflowExecution {
            execution_id,
            workflow_id,
            status: ExecutionStatus::Running,
            step_states,
            context,
            started_at_ms: event.occurred_at_ms,
            finished_at_ms: None,
        }
    }
}
