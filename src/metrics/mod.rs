//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, path, and status
//! - Request latency histogram
//! - Authentication failures by reason
//! - Fallback responses and circuit state per service

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::breaker::CircuitState;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    auth_failures: CounterVec,
    fallback_counter: CounterVec,
    circuit_state: GaugeVec,
    total_requests: Arc<AtomicU64>,
    total_errors: Arc<AtomicU64>,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "path", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("Failed to create latency histogram");

        let auth_failures = CounterVec::new(
            Opts::new(
                "gateway_auth_failures_total",
                "Requests rejected by token validation",
            ),
            &["reason"],
        )
        .expect("Failed to create auth failure counter");

        let fallback_counter = CounterVec::new(
            Opts::new(
                "gateway_fallback_responses_total",
                "Fallback responses served per service",
            ),
            &["service"],
        )
        .expect("Failed to create fallback counter");

        let circuit_state = GaugeVec::new(
            Opts::new(
                "gateway_circuit_breaker_state",
                "Circuit state per service (0 closed, 1 half-open, 2 open)",
            ),
            &["service"],
        )
        .expect("Failed to create circuit state gauge");

        for collector in [
            Box::new(request_counter.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_latency.clone()),
            Box::new(auth_failures.clone()),
            Box::new(fallback_counter.clone()),
            Box::new(circuit_state.clone()),
        ] {
            registry
                .register(collector)
                .expect("Failed to register gateway metric");
        }

        Self {
            registry,
            request_counter,
            request_latency,
            auth_failures,
            fallback_counter,
            circuit_state,
            total_requests: Arc::new(AtomicU64::new(0)),
            total_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a request with its status and latency
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();
        let normalized_path = Self::normalize_path(path);

        self.request_counter
            .with_label_values(&[method, &normalized_path, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, &normalized_path])
            .observe(latency.as_secs_f64());

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_auth_failure(&self, reason: &str) {
        self.auth_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_fallback(&self, service: &str) {
        self.fallback_counter.with_label_values(&[service]).inc();
    }

    pub fn set_circuit_state(&self, service: &str, state: CircuitState) {
        self.circuit_state
            .with_label_values(&[service])
            .set(state.as_gauge());
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Normalize path to reduce cardinality
    /// Replace IDs and numbers with placeholders
    fn normalize_path(path: &str) -> String {
        path.split('/')
            .map(|part| {
                if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                    ":id"
                } else if part.len() >= 8 && part.chars().all(|c| c.is_ascii_hexdigit()) {
                    ":uuid"
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
