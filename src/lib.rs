//! Artztall Gateway - API gateway request pipeline
//!
//! This is a gateway service that provides:
//! - Public/secured path classification
//! - HMAC-signed bearer token validation
//! - Ordered route table with path rewriting
//! - Per-service circuit breakers with fallback responses
//! - Prometheus metrics
//! - Health checks

pub mod auth;
pub mod breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod route;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use pipeline::{PipelineComponents, RequestPipeline};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
