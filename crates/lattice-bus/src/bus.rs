//! # Message Bus
//!
//! The delivery engine. Callers enqueue messages; a dispatcher loop pulls
//! them in priority order under a global concurrency ceiling and hands each
//! to the target module's registered handler. Failures are retried with
//! exponential backoff until the attempt budget is spent, then parked in the
//! dead-letter queue and reported as a failure event.

use crate::breaker::{BreakerRegistry, BreakerState, DispatchDecision};
use crate::config::BusConfig;
use crate::dead_letter::{DeadLetterQueue, DeadLetterRecord};
use crate::queue::DeliveryQueue;
use lattice_telemetry::metrics as telemetry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::{CommsError, DynHandler, Message, MessageStatus, ModuleId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of the failure-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure events emitted by the bus for external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    /// A message exhausted its attempt budget. Emitted exactly once per
    /// message.
    DeadLettered {
        /// The dead-lettered message.
        message_id: Uuid,
        /// The target that kept failing.
        module: ModuleId,
        /// Attempts made.
        attempts: u32,
        /// Final failure reason.
        reason: String,
    },
    /// A module's circuit breaker opened.
    CircuitOpened {
        /// The module now fenced off.
        module: ModuleId,
    },
}

/// Point-in-time view of bus activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMetricsSnapshot {
    /// Messages accepted for delivery.
    pub sent: u64,
    /// Messages acknowledged by a handler.
    pub delivered: u64,
    /// Messages that failed terminally.
    pub failed: u64,
    /// Requeues scheduled by the retry policy.
    pub retried: u64,
    /// Messages parked in the dead-letter queue.
    pub dead_lettered: u64,
    /// Current queue depth across all priorities.
    pub queue_depth: usize,
    /// Modules with a non-closed breaker.
    pub open_breakers: Vec<ModuleId>,
}

/// Atomic counters backing [`BusMetricsSnapshot`].
#[derive(Default)]
struct BusCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Per-target delivery statistics, fed to discovery for tie-breaking.
#[derive(Default)]
struct ModuleStats {
    attempts: AtomicU64,
    failures: AtomicU64,
}

type PendingMap = Mutex<HashMap<Uuid, oneshot::Sender<Result<serde_json::Value, CommsError>>>>;

/// Deliveries for the same pair are serialized through one lane so FIFO
/// holds end to end, not just at dequeue time.
type LaneKey = (ModuleId, Option<ModuleId>);
type LaneSender = mpsc::UnboundedSender<(Message, OwnedSemaphorePermit)>;

/// The inter-module message bus.
pub struct MessageBus {
    config: BusConfig,
    queue: Arc<DeliveryQueue>,
    handlers: RwLock<HashMap<ModuleId, DynHandler>>,
    breakers: BreakerRegistry,
    dead_letters: DeadLetterQueue,
    /// Waiters for correlated responses, keyed by `correlation_id`.
    pending: PendingMap,
    events: broadcast::Sender<BusEvent>,
    permits: Arc<Semaphore>,
    /// One delivery worker per `(source, target)` pair.
    lanes: Mutex<HashMap<LaneKey, LaneSender>>,
    counters: BusCounters,
    module_stats: RwLock<HashMap<ModuleId, Arc<ModuleStats>>>,
    started: AtomicBool,
}

impl MessageBus {
    /// Create a bus with the given configuration. Call
    /// [`start`](Self::start) to spawn the dispatcher.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue: Arc::new(DeliveryQueue::new(config.queue_capacity)),
            handlers: RwLock::new(HashMap::new()),
            breakers: BreakerRegistry::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown,
            ),
            dead_letters: DeadLetterQueue::new(),
            pending: Mutex::new(HashMap::new()),
            events,
            permits: Arc::new(Semaphore::new(config.worker_ceiling)),
            lanes: Mutex::new(HashMap::new()),
            counters: BusCounters::default(),
            module_stats: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            config,
        }
    }

    /// Spawn the dispatcher loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Acquire a permit before pulling work so the global
                // concurrency ceiling also bounds queue drain rate.
                let Ok(permit) = bus.permits.clone().acquire_owned().await else {
                    break;
                };
                let Some(message) = bus.queue.pop().await else {
                    break;
                };
                bus.route_to_lane(message, permit);
            }
            // Dropping the senders lets the lane workers drain and exit.
            bus.lanes.lock().clear();
            debug!("Bus dispatcher stopped");
        });
    }

    /// Hand a message to its pair's lane worker, spawning the worker on
    /// first use. The worker delivers one message at a time, so messages
    /// for the same `(source, target)` pair complete in dequeue order.
    fn route_to_lane(self: &Arc<Self>, message: Message, permit: OwnedSemaphorePermit) {
        let key = (message.source_module.clone(), message.target_module.clone());
        let mut lanes = self.lanes.lock();
        let sender = lanes.entry(key).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Message, OwnedSemaphorePermit)>();
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((message, permit)) = rx.recv().await {
                    worker.deliver(message).await;
                    drop(permit);
                }
            });
            tx
        });
        if sender.send((message, permit)).is_err() {
            debug!("Lane worker gone, message dropped during shutdown");
        }
    }

    /// Stop accepting work. In-flight deliveries finish; the backlog drains.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// Register the handler for a module. Replaces any existing handler.
    pub fn register_handler(&self, module: ModuleId, handler: DynHandler) {
        debug!(module = %module, "Handler registered");
        self.handlers.write().insert(module, handler);
    }

    /// Remove a module's handler.
    pub fn deregister_handler(&self, module: &ModuleId) {
        self.handlers.write().remove(module);
    }

    /// Send a request and wait for the correlated response.
    ///
    /// Blocks the caller up to the configured request timeout. Dropping the
    /// returned future cancels the wait; a late response is discarded.
    ///
    /// # Errors
    ///
    /// Any [`CommsError`]; timeout surfaces as `DeliveryTimeout`, distinct
    /// from delivery failures.
    pub async fn send(&self, message: Message) -> Result<serde_json::Value, CommsError> {
        self.send_with_timeout(message, self.config.request_timeout)
            .await
    }

    /// [`send`](Self::send) with an explicit caller-visible timeout.
    pub async fn send_with_timeout(
        &self,
        message: Message,
        wait: Duration,
    ) -> Result<serde_json::Value, CommsError> {
        let message_id = message.id;
        let correlation_id = message.correlation_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        if let Err(e) = self.enqueue(message) {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            // Delivery path dropped the sender without responding; treat as
            // a timeout-equivalent loss.
            Ok(Err(_closed)) => Err(CommsError::DeliveryTimeout {
                message_id,
                timeout_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(_elapsed) => {
                self.pending.lock().remove(&correlation_id);
                Err(CommsError::DeliveryTimeout {
                    message_id,
                    timeout_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Enqueue a fire-and-forget message (point-to-point, pub-sub, or
    /// broadcast). No response is expected.
    ///
    /// # Errors
    ///
    /// `CommsError::QueueFull` under backpressure.
    pub fn publish(&self, message: Message) -> Result<(), CommsError> {
        self.enqueue(message)
    }

    /// Subscribe to failure events (dead-letters, breaker transitions).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the dead-letter queue for operator inspection.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.records()
    }

    /// Re-enqueue a copy of a dead-lettered message. Returns the new
    /// message id, or `None` if no such record exists.
    pub fn replay_dead_letter(&self, message_id: Uuid) -> Option<Uuid> {
        let copy = self.dead_letters.replay_copy(message_id)?;
        let new_id = copy.id;
        match self.enqueue(copy) {
            Ok(()) => Some(new_id),
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Dead-letter replay rejected");
                None
            }
        }
    }

    /// Current breaker state for a module, if one has been created.
    #[must_use]
    pub fn breaker_state(&self, module: &ModuleId) -> Option<BreakerState> {
        self.breakers.state(module)
    }

    /// Observed failure rate for a module (failures / attempts), `0.0` when
    /// nothing has been dispatched yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self, module: &ModuleId) -> f64 {
        let Some(stats) = self.module_stats.read().get(module).cloned() else {
            return 0.0;
        };
        let attempts = stats.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        stats.failures.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Point-in-time metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            sent: self.counters.sent.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            open_breakers: self.breakers.open_modules(),
        }
    }

    // =========================================================================
    // DELIVERY PATH
    // =========================================================================

    fn enqueue(&self, message: Message) -> Result<(), CommsError> {
        self.queue.push(message)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn deliver(self: &Arc<Self>, mut message: Message) {
        message.status = MessageStatus::Processing;
        if message.target_module.is_some() {
            self.deliver_to_target(message).await;
        } else {
            self.deliver_broadcast(message).await;
        }
    }

    async fn deliver_to_target(self: &Arc<Self>, mut message: Message) {
        let Some(target) = message.target_module.clone() else {
            return;
        };

        let decision = self.breakers.try_dispatch(&target);
        if decision == DispatchDecision::Reject {
            // Fail fast: no handler call, no retry.
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            telemetry::MODULE_ERRORS
                .with_label_values(&[target.as_str(), "circuit_open"])
                .inc();
            self.respond(
                &message,
                Err(CommsError::TargetUnavailable {
                    module: target.clone(),
                }),
            );
            debug!(module = %target, message_id = %message.id, "Rejected: circuit open");
            return;
        }
        let probing = decision == DispatchDecision::Probe;
        if probing {
            debug!(module = %target, message_id = %message.id, "Half-open probe dispatch");
        }

        let handler = self.handlers.read().get(&target).cloned();
        let Some(handler) = handler else {
            // An unresolved probe would fence the target forever; a missing
            // handler counts as a failed probe and restarts the cooldown.
            if probing && self.breakers.record_failure(&target) {
                let _ = self.events.send(BusEvent::CircuitOpened {
                    module: target.clone(),
                });
            }
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            telemetry::MODULE_ERRORS
                .with_label_values(&[target.as_str(), "no_handler"])
                .inc();
            self.respond(
                &message,
                Err(CommsError::NoHandler {
                    module: target.clone(),
                }),
            );
            return;
        };

        let stats = self.stats_for(&target);
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        message.attempt_count = message.attempt_count.saturating_add(1);

        let outcome = timeout(self.config.handler_timeout, handler.handle(message.clone())).await;
        match outcome {
            Ok(Ok(value)) => {
                self.breakers.record_success(&target);
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                message.status = MessageStatus::Delivered;
                self.respond(&message, Ok(value));
            }
            Ok(Err(handler_err)) if !handler_err.is_retryable() => {
                // Rejected request shape: permanent, surfaced immediately.
                // Still resolves an in-flight probe, as failure.
                if probing && self.breakers.record_failure(&target) {
                    let _ = self.events.send(BusEvent::CircuitOpened {
                        module: target.clone(),
                    });
                }
                stats.failures.fetch_add(1, Ordering::Relaxed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                telemetry::MODULE_ERRORS
                    .with_label_values(&[target.as_str(), "rejected"])
                    .inc();
                self.respond(
                    &message,
                    Err(CommsError::SchemaValidationFailure {
                        reason: handler_err.to_string(),
                    }),
                );
            }
            Ok(Err(handler_err)) => {
                self.attempt_failed(message, &target, handler_err.to_string(), "handler_failure");
            }
            Err(_elapsed) => {
                self.attempt_failed(
                    message,
                    &target,
                    "handler attempt timed out".to_string(),
                    "timeout",
                );
            }
        }
    }

    /// A retryable attempt failed: back off and requeue, or dead-letter once
    /// the budget is spent.
    fn attempt_failed(
        self: &Arc<Self>,
        mut message: Message,
        target: &ModuleId,
        reason: String,
        error_kind: &'static str,
    ) {
        telemetry::MODULE_ERRORS
            .with_label_values(&[target.as_str(), error_kind])
            .inc();
        self.stats_for(target).failures.fetch_add(1, Ordering::Relaxed);
        if self.breakers.record_failure(target) {
            let _ = self.events.send(BusEvent::CircuitOpened {
                module: target.clone(),
            });
        }

        if message.attempts_exhausted() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            telemetry::MESSAGES_DEAD_LETTERED.inc();
            self.respond(
                &message,
                Err(CommsError::DeadLettered {
                    message_id: message.id,
                    attempts: message.attempt_count,
                }),
            );
            let event = BusEvent::DeadLettered {
                message_id: message.id,
                module: target.clone(),
                attempts: message.attempt_count,
                reason: reason.clone(),
            };
            self.dead_letters.park(message, reason);
            let _ = self.events.send(event);
            return;
        }

        message.status = MessageStatus::Failed;
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let backoff = self.config.backoff_for_attempt(message.attempt_count);
        debug!(
            message_id = %message.id,
            attempt = message.attempt_count,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "Attempt failed, requeueing"
        );

        let bus = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let message_id = message.id;
            let attempts = message.attempt_count;
            let target = message.target_module.clone();
            if bus.queue.push(message.clone()).is_err() {
                // Queue full on requeue: terminal, park rather than drop.
                bus.counters.failed.fetch_add(1, Ordering::Relaxed);
                bus.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                telemetry::MESSAGES_DEAD_LETTERED.inc();
                bus.respond(
                    &message,
                    Err(CommsError::DeadLettered {
                        message_id,
                        attempts,
                    }),
                );
                bus.dead_letters.park(message, "requeue rejected: queue full");
                if let Some(module) = target {
                    let _ = bus.events.send(BusEvent::DeadLettered {
                        message_id,
                        module,
                        attempts,
                        reason: "requeue rejected: queue full".to_string(),
                    });
                }
            }
        });
    }

    /// Fan a broadcast out to every registered handler except the source.
    /// Broadcast is fire-and-forget per target: failures feed the breaker
    /// and stats but are not retried.
    async fn deliver_broadcast(self: &Arc<Self>, message: Message) {
        let targets: Vec<(ModuleId, DynHandler)> = self
            .handlers
            .read()
            .iter()
            .filter(|(id, _)| **id != message.source_module)
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        for (target, handler) in targets {
            if self.breakers.try_dispatch(&target) == DispatchDecision::Reject {
                debug!(module = %target, "Broadcast skipped: circuit open");
                continue;
            }

            let stats = self.stats_for(&target);
            stats.attempts.fetch_add(1, Ordering::Relaxed);

            let mut copy = message.clone();
            copy.target_module = Some(target.clone());
            let outcome = timeout(self.config.handler_timeout, handler.handle(copy)).await;
            match outcome {
                Ok(Ok(_)) => {
                    self.breakers.record_success(&target);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    if self.breakers.record_failure(&target) {
                        let _ = self.events.send(BusEvent::CircuitOpened {
                            module: target.clone(),
                        });
                    }
                    warn!(module = %target, error = %e, "Broadcast handler failed");
                }
                Err(_elapsed) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    if self.breakers.record_failure(&target) {
                        let _ = self.events.send(BusEvent::CircuitOpened {
                            module: target.clone(),
                        });
                    }
                    warn!(module = %target, "Broadcast handler timed out");
                }
            }
        }
    }

    /// Complete the caller's wait, if anyone is still waiting. A missing
    /// waiter means a fire-and-forget pattern, a cancelled caller, or an
    /// elapsed timeout; the result is discarded either way.
    fn respond(&self, message: &Message, result: Result<serde_json::Value, CommsError>) {
        if let Some(waiter) = self.pending.lock().remove(&message.correlation_id) {
            if waiter.send(result).is_err() {
                debug!(message_id = %message.id, "Caller gone, response discarded");
            }
        }
    }

    fn stats_for(&self, module: &ModuleId) -> Arc<ModuleStats> {
        if let Some(stats) = self.module_stats.read().get(module) {
            return stats.clone();
        }
        self.module_stats
            .write()
            .entry(module.clone())
            .or_default()
            .clone()
    }
}
