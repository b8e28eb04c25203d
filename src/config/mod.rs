//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files.

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::classifier::DEFAULT_PUBLIC_PATHS;
use crate::route::RouteTable;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Environment variable overriding `auth.secret`
pub const SECRET_ENV_VAR: &str = "GATEWAY_JWT_SECRET";

fn default_enabled() -> bool {
    true
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backend call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Liveness path; readiness is served at `<path>/ready`
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
        }
    }
}

/// Token authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC signing secret shared with the user service
    #[serde(default)]
    pub secret: String,
    /// Header carrying the token subject to the backend; empty disables it
    #[serde(default = "default_subject_header")]
    pub subject_header: Option<String>,
    /// Paths served without a token (`/exact` or `/prefix/**`)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_subject_header() -> Option<String> {
    Some("X-User-Id".to_string())
}

fn default_public_paths() -> Vec<String> {
    DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            subject_header: default_subject_header(),
            public_paths: default_public_paths(),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

fn default_cors_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![],
            max_age_secs: default_cors_max_age(),
        }
    }
}

impl CorsConfig {
    /// Build the CORS layer; `None` when no origin is allowed
    pub fn layer(&self) -> anyhow::Result<Option<CorsLayer>> {
        if self.allowed_origins.is_empty() {
            return Ok(None);
        }

        let origins = self
            .allowed_origins
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()?;

        let layer = CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([CONTENT_TYPE, AUTHORIZATION])
            .allow_credentials(true)
            .max_age(Duration::from_secs(self.max_age_secs));

        Ok(Some(layer))
    }
}

/// Default circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Backend service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the service, e.g. `http://127.0.0.1:8081`
    pub address: String,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

/// Path rewrite declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Capture template, e.g. `/api/users/(?<segment>.*)`
    pub pattern: String,
    /// Replacement, e.g. `/${segment}`
    pub replacement: String,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// Single path pattern (`/api/users/**`, `/exact`, or a capture template)
    #[serde(default)]
    pub path: Option<String>,
    /// List of exact paths, used instead of `path`
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,
    /// Logical service name, a key of `[services]`
    pub service: String,
    #[serde(default = "default_enabled")]
    pub requires_auth: bool,
    /// Fallback responder; setting it puts the route behind a circuit breaker
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub description: Option<String>,
}

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Route declarations; order is significant
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "crate::fallback::default_messages")]
    pub fallbacks: BTreeMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            services: BTreeMap::new(),
            routes: vec![],
            fallbacks: crate::fallback::default_messages(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: GatewayConfig = toml::from_str(&contents)?;
        if let Ok(secret) = std::env::var(SECRET_ENV_VAR) {
            config.auth.secret = secret;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = std::collections::HashSet::new();
        for route in &self.routes {
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("Duplicate route id '{}'", route.id);
            }
            if !self.services.contains_key(&route.service) {
                anyhow::bail!(
                    "Route '{}' references unknown service '{}'",
                    route.id,
                    route.service
                );
            }
            if let Some(fallback) = &route.fallback {
                if !self.fallbacks.contains_key(fallback) {
                    anyhow::bail!(
                        "Route '{}' references unknown fallback '{}'",
                        route.id,
                        fallback
                    );
                }
            }
        }

        // Compiles every pattern
        RouteTable::from_config(&self.routes)?;
        crate::classifier::PathClassifier::from_patterns(&self.auth.public_paths)?;

        let needs_secret = self.enabled_routes().iter().any(|r| r.requires_auth);
        if needs_secret && self.auth.secret.is_empty() {
            anyhow::bail!(
                "Routes require authentication but no secret is configured (set auth.secret or {})",
                SECRET_ENV_VAR
            );
        }

        if let Some(header) = self.subject_header() {
            header
                .parse::<HeaderName>()
                .map_err(|e| anyhow::anyhow!("Invalid subject header '{}': {}", header, e))?;
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        for (name, service) in &self.services {
            if service.failure_threshold == Some(0) {
                anyhow::bail!("Service '{}' failure_threshold must be at least 1", name);
            }
            if !service.address.starts_with("http://") {
                anyhow::bail!(
                    "Service '{}' address '{}' must be an http:// URL",
                    name,
                    service.address
                );
            }
        }

        if self.server.timeout == 0 {
            anyhow::bail!("server.timeout must be at least 1 second");
        }

        if self.cors.allowed_origins.iter().any(|o| o == "*") {
            anyhow::bail!("cors.allowed_origins must list concrete origins when credentials are allowed");
        }
        self.cors.layer()?;

        Ok(())
    }

    /// Subject header name, if injection is enabled
    pub fn subject_header(&self) -> Option<&str> {
        self.auth
            .subject_header
            .as_deref()
            .filter(|h| !h.trim().is_empty())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    /// Get enabled routes
    pub fn enabled_routes(&self) -> Vec<&RouteConfig> {
        self.routes.iter().filter(|r| r.enabled).collect()
    }

    /// Breaker thresholds for a service, falling back to the defaults
    pub fn breaker_config_for(&self, service: &str) -> BreakerConfig {
        let defaults = &self.circuit_breaker;
        let overrides = self.services.get(service);
        BreakerConfig {
            failure_threshold: overrides
                .and_then(|s| s.failure_threshold)
                .unwrap_or(defaults.failure_threshold),
            cooldown: Duration::from_secs(
                overrides
                    .and_then(|s| s.cooldown_secs)
                    .unwrap_or(defaults.cooldown_secs),
            ),
        }
    }

    /// Breaker registry with the configured thresholds
    pub fn breaker_registry(&self) -> BreakerRegistry {
        let defaults = BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
        };
        self.services
            .iter()
            .filter(|(_, s)| s.failure_threshold.is_some() || s.cooldown_secs.is_some())
            .fold(BreakerRegistry::new(defaults), |registry, (name, _)| {
                registry.with_override(name.clone(), self.breaker_config_for(name))
            })
    }
}

/// Sample configuration reproducing the artztall route set
pub const SAMPLE_CONFIG: &str = r#"# Artztall API Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
timeout = 10

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"

[auth]
# Overridden by the GATEWAY_JWT_SECRET environment variable
secret = "change-me"
subject_header = "X-User-Id"
public_paths = [
    "/api/auth/login",
    "/api/auth/signup",
    "/api/auth/verify/**",
    "/api/public/**",
    "/api/products/**",
]

[cors]
allowed_origins = ["http://localhost:3000"]

[circuit_breaker]
failure_threshold = 5
cooldown_secs = 30

[services.user-service]
address = "http://127.0.0.1:8081"

[services.product-service]
address = "http://127.0.0.1:8082"

[services.order-service]
address = "http://127.0.0.1:8083"

[services.payment-service]
address = "http://127.0.0.1:8084"
failure_threshold = 3

[services.auction-service]
address = "http://127.0.0.1:8085"

# Routes are matched in declaration order; the first match wins.
[[routes]]
id = "user-service-public"
paths = ["/api/v1/auth/register", "/api/v1/auth/authenticate"]
rewrite = { pattern = "/api/v1/auth/(?<segment>.*)", replacement = "/${segment}" }
service = "user-service"
requires_auth = false

# Login, signup and verification links are served without a token
[[routes]]
id = "user-service-auth"
path = "/api/auth/**"
rewrite = { pattern = "/api/auth/(?<segment>.*)", replacement = "/${segment}" }
service = "user-service"
requires_auth = false

[[routes]]
id = "user-service"
path = "/api/users/**"
rewrite = { pattern = "/api/users/(?<segment>.*)", replacement = "/${segment}" }
service = "user-service"
fallback = "user"

[[routes]]
id = "product-service"
path = "/api/products/**"
rewrite = { pattern = "/api/products/(?<segment>.*)", replacement = "/${segment}" }
service = "product-service"
fallback = "product"

[[routes]]
id = "order-service"
path = "/api/orders/**"
rewrite = { pattern = "/api/orders/(?<segment>.*)", replacement = "/${segment}" }
service = "order-service"
fallback = "order"

[[routes]]
id = "payment-service"
path = "/api/payments/**"
rewrite = { pattern = "/api/payments/(?<segment>.*)", replacement = "/${segment}" }
service = "payment-service"
fallback = "payment"

[[routes]]
id = "auction-service"
path = "/api/auctions/**"
rewrite = { pattern = "/api/auctions/(?<segment>.*)", replacement = "/${segment}" }
service = "auction-service"
fallback = "auction"

[fallbacks]
user = "User Service is taking longer than expected. Please try again later."
product = "Product Service is taking longer than expected. Please try again later."
order = "Order Service is taking longer than expected. Please try again later."
payment = "Payment Service is taking longer than expected. Please try again later."
auction = "Auction Service is taking longer than expected. Please try again later."
"#;
