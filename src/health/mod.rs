//! Health check module
//!
//! This module provides health check functionality for the gateway service:
//! - Basic liveness check
//! - Readiness check reporting the circuit state of every backend seen so far:
//!   degraded while any circuit is not closed, unhealthy once all are open

use crate::breaker::{BreakerRegistry, BreakerSnapshot, CircuitState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub circuits: BTreeMap<String, BreakerSnapshot>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    breakers: Arc<BreakerRegistry>,
    version: String,
}

impl HealthChecker {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            start_time: Instant::now(),
            breakers,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get liveness status (always healthy if the service is running)
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message: None,
            circuits: BTreeMap::new(),
        }
    }

    /// Readiness derived from the backend circuits
    pub fn readiness(&self) -> HealthResponse {
        let circuits = self.breakers.snapshot();
        let broken: Vec<&str> = circuits
            .iter()
            .filter(|(_, c)| c.state != CircuitState::Closed)
            .map(|(name, _)| name.as_str())
            .collect();
        let all_open = !circuits.is_empty()
            && circuits.values().all(|c| c.state == CircuitState::Open);

        let (status, message) = if broken.is_empty() {
            (HealthStatus::Healthy, None)
        } else if all_open {
            (
                HealthStatus::Unhealthy,
                Some(format!("Circuit open for every backend: {}", broken.join(", "))),
            )
        } else {
            (
                HealthStatus::Degraded,
                Some(format!("Circuit not closed for: {}", broken.join(", "))),
            )
        };

        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message,
            circuits,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, Decision};
    use std::time::Duration;

    #[test]
    fn test_liveness() {
        let checker = HealthChecker::new(Arc::new(BreakerRegistry::default()));
        let health = checker.liveness();

        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(!health.version.is_empty());
        assert!(health.circuits.is_empty());
    }

    fn fail(breakers: &BreakerRegistry, service: &str) {
        let Decision::Allow(permit) = breakers.guard(service) else {
            panic!("{service} should be closed");
        };
        breakers.report_outcome(service, permit, false);
    }

    fn breakers() -> Arc<BreakerRegistry> {
        Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
        }))
    }

    #[test]
    fn test_readiness_degrades_when_circuit_opens() {
        let breakers = breakers();
        let checker = HealthChecker::new(Arc::clone(&breakers));

        breakers.guard("order-service");
        breakers.guard("product-service");
        assert_eq!(checker.readiness().status, HealthStatus::Healthy);

        fail(&breakers, "order-service");
        let health = checker.readiness();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.circuits["order-service"].state, CircuitState::Open);
        assert!(health.message.unwrap().contains("order-service"));
    }

    #[test]
    fn test_readiness_unhealthy_when_every_circuit_is_open() {
        let breakers = breakers();
        let checker = HealthChecker::new(Arc::clone(&breakers));

        fail(&breakers, "order-service");
        fail(&breakers, "product-service");

        let health = checker.readiness();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.circuits.len(), 2);
    }

    #[test]
    fn test_readiness_without_traffic_is_healthy() {
        let checker = HealthChecker::new(breakers());
        assert_eq!(checker.readiness().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(HealthStatus::Degraded).unwrap(),
            serde_json::json!("degraded")
        );
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }
}
