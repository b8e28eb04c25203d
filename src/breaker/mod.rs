//! Per-service circuit breakers
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open ◄──────────┐
//!     ▲                                │              │
//!     │ probe succeeds                 │ cooldown     │ probe fails
//!     │                                ▼ elapsed      │
//!     └──────────────────────────── HalfOpen ─────────┘
//!                                 (one probe in flight)
//! ```
//!
//! Each logical service owns one [`BreakerState`], created on first use and
//! guarded by its own mutex, so transitions of one service are atomic and
//! services never contend with each other.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are redirected to the fallback
    Open,
    /// A single probe call decides between Closed and Open
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Thresholds of one service's breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe is let through
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Admission of one call; handed back when its outcome is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    probe: bool,
}

impl Permit {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow(Permit),
    Fallback,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Mutable health record of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerState {
    pub status: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub half_open_probes_in_flight: u32,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            status: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_in_flight: 0,
        }
    }
}

impl BreakerState {
    fn trip(&mut self, now: Instant) {
        self.status = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_probes_in_flight = 0;
    }

    fn guard(&mut self, config: &BreakerConfig, now: Instant) -> Decision {
        match self.status {
            CircuitState::Closed => Decision::Allow(Permit { probe: false }),
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= config.cooldown);
                if cooled_down {
                    self.status = CircuitState::HalfOpen;
                    self.half_open_probes_in_flight = 1;
                    Decision::Allow(Permit { probe: true })
                } else {
                    Decision::Fallback
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_probes_in_flight == 0 {
                    self.half_open_probes_in_flight = 1;
                    Decision::Allow(Permit { probe: true })
                } else {
                    Decision::Fallback
                }
            }
        }
    }

    fn record(&mut self, config: &BreakerConfig, permit: Permit, success: bool, now: Instant) {
        // Only the probe settles a half-open circuit
        if self.status == CircuitState::HalfOpen && !permit.probe {
            return;
        }
        match (self.status, success) {
            (CircuitState::Closed, true) => self.consecutive_failures = 0,
            (CircuitState::Closed, false) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= config.failure_threshold {
                    self.trip(now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                self.status = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.half_open_probes_in_flight = 0;
            }
            (CircuitState::HalfOpen, false) => self.trip(now),
            // Late outcome of a call admitted before the circuit opened
            (CircuitState::Open, _) => {}
        }
    }

    fn release(&mut self, permit: Permit) {
        if permit.probe && self.status == CircuitState::HalfOpen {
            self.half_open_probes_in_flight = 0;
        }
    }
}

/// Point-in-time view of a service breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Arena of breaker states indexed by service name
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    states: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            states: DashMap::new(),
        }
    }

    /// Use different thresholds for one service
    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    pub fn config_for(&self, service: &str) -> BreakerConfig {
        self.overrides.get(service).copied().unwrap_or(self.defaults)
    }

    fn cell(&self, service: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(cell) = self.states.get(service) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.states.entry(service.to_string()).or_default().value())
    }

    fn with_state<T>(&self, service: &str, f: impl FnOnce(&mut BreakerState) -> T) -> T {
        let cell = self.cell(service);
        let mut state = cell.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Decide whether a call to `service` may reach the backend
    pub fn guard(&self, service: &str) -> Decision {
        self.guard_at(service, Instant::now())
    }

    pub(crate) fn guard_at(&self, service: &str, now: Instant) -> Decision {
        let config = self.config_for(service);
        self.with_state(service, |state| {
            let before = state.status;
            let decision = state.guard(&config, now);
            if before != state.status {
                info!(service, from = %before, to = %state.status, "Circuit breaker admitting probe");
            } else if !decision.is_allowed() {
                debug!(service, state = %state.status, "Circuit breaker rejected call");
            }
            decision
        })
    }

    /// Record the outcome of an admitted call; returns the state afterwards
    pub fn report_outcome(&self, service: &str, permit: Permit, success: bool) -> CircuitState {
        self.report_outcome_at(service, permit, success, Instant::now())
    }

    pub(crate) fn report_outcome_at(
        &self,
        service: &str,
        permit: Permit,
        success: bool,
        now: Instant,
    ) -> CircuitState {
        let config = self.config_for(service);
        self.with_state(service, |state| {
            let before = state.status;
            state.record(&config, permit, success, now);

            match (before, state.status) {
                (CircuitState::Closed, CircuitState::Open) => warn!(
                    service,
                    failures = state.consecutive_failures,
                    cooldown = ?config.cooldown,
                    "Circuit breaker opened due to consecutive failures"
                ),
                (CircuitState::HalfOpen, CircuitState::Open) => {
                    warn!(service, "Circuit breaker reopened after failed probe")
                }
                (CircuitState::HalfOpen, CircuitState::Closed) => {
                    info!(service, "Circuit breaker closed after successful probe")
                }
                (CircuitState::Open, _) => {
                    debug!(service, success, "Ignoring outcome reported while open")
                }
                (CircuitState::HalfOpen, CircuitState::HalfOpen) => {
                    debug!(service, success, "Ignoring outcome of a call admitted before the probe")
                }
                _ => {}
            }
            state.status
        })
    }

    /// Give back a permit without an outcome; a released probe slot is
    /// handed to the next caller
    pub fn release(&self, service: &str, permit: Permit) -> CircuitState {
        self.with_state(service, |state| {
            state.release(permit);
            state.status
        })
    }

    /// Current state; unknown services are closed
    pub fn state(&self, service: &str) -> CircuitState {
        self.states
            .get(service)
            .map(|cell| {
                cell.value()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .status
            })
            .unwrap_or(CircuitState::Closed)
    }

    /// States of every service seen so far
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.states
            .iter()
            .map(|entry| {
                let state = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
                (
                    entry.key().clone(),
                    BreakerSnapshot {
                        state: state.status,
                        consecutive_failures: state.consecutive_failures,
                    },
                )
            })
            .collect()
    }
}
