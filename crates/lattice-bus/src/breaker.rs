//! # Per-Module Circuit Breakers
//!
//! One breaker per target module stops dispatch to a consistently failing
//! module. State machine: `Closed` → (threshold failures) → `Open` →
//! (cooldown, single probe) → `HalfOpen` → `Closed` on probe success or back
//! to `Open` on probe failure.
//!
//! The registry shards breakers per module id so unrelated traffic never
//! contends on one lock.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::ModuleId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Normal operation; failures are counted.
    Closed,
    /// Dispatch blocked until the cooldown elapses.
    Open,
    /// Cooldown elapsed; exactly one probe is in flight.
    HalfOpen,
}

/// What a worker may do with a message for this target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Breaker closed; dispatch normally.
    Allow,
    /// Breaker half-open; this dispatch is the single permitted probe.
    Probe,
    /// Breaker open; fail fast without a dispatch attempt.
    Reject,
}

/// Failure-tracking state machine for one target module.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            failure_threshold,
            cooldown,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive failures recorded while closed.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a dispatch may proceed.
    ///
    /// In `Open` state, the first call after the cooldown transitions the
    /// breaker to `HalfOpen` and is granted the probe; every other call is
    /// rejected until the probe resolves.
    pub fn try_dispatch(&mut self) -> DispatchDecision {
        match self.state {
            BreakerState::Closed => DispatchDecision::Allow,
            BreakerState::HalfOpen => DispatchDecision::Reject,
            BreakerState::Open => {
                let cooled_down = self
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled_down {
                    self.state = BreakerState::HalfOpen;
                    DispatchDecision::Probe
                } else {
                    DispatchDecision::Reject
                }
            }
        }
    }

    /// Record a successful dispatch. Closes the breaker and resets the
    /// failure count.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a failed dispatch.
    ///
    /// Returns `true` when this failure opened the breaker (either the
    /// threshold was crossed or a half-open probe failed).
    pub fn record_failure(&mut self) -> bool {
        match self.state {
            BreakerState::HalfOpen => {
                // Failed probe: reopen and restart the cooldown.
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
                true
            }
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }
}

/// Shared map of per-module breakers.
///
/// The outer map is only locked to find or insert an entry; all state
/// transitions happen under the per-module mutex.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<ModuleId, Arc<Mutex<CircuitBreaker>>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    /// Create a registry with shared thresholds for all breakers.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    /// Find or create the breaker for a module.
    pub fn breaker_for(&self, module: &ModuleId) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(existing) = self.breakers.read().get(module) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(module.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    self.failure_threshold,
                    self.cooldown,
                )))
            })
            .clone()
    }

    /// Decide whether a dispatch to `module` may proceed.
    pub fn try_dispatch(&self, module: &ModuleId) -> DispatchDecision {
        self.breaker_for(module).lock().try_dispatch()
    }

    /// Record a success for `module`.
    pub fn record_success(&self, module: &ModuleId) {
        let breaker = self.breaker_for(module);
        let mut breaker = breaker.lock();
        if breaker.state() != BreakerState::Closed {
            info!(module = %module, "Circuit breaker closed");
        }
        breaker.record_success();
    }

    /// Record a failure for `module`. Returns `true` when this failure
    /// opened the breaker.
    pub fn record_failure(&self, module: &ModuleId) -> bool {
        let breaker = self.breaker_for(module);
        let opened = breaker.lock().record_failure();
        if opened {
            warn!(module = %module, "Circuit breaker opened");
        }
        opened
    }

    /// Current state of a module's breaker, if one exists.
    #[must_use]
    pub fn state(&self, module: &ModuleId) -> Option<BreakerState> {
        self.breakers
            .read()
            .get(module)
            .map(|b| b.lock().state())
    }

    /// Modules whose breakers are currently open or half-open.
    #[must_use]
    pub fn open_modules(&self) -> Vec<ModuleId> {
        self.breakers
            .read()
            .iter()
            .filter(|(_, b)| b.lock().state() != BreakerState::Closed)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
