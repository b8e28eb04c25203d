//! Artztall Gateway - CLI Application
//!
//! API gateway in front of the artztall services with:
//! - Route configuration via TOML
//! - Bearer token authentication
//! - Per-service circuit breakers and fallbacks
//! - Prometheus metrics

use artztall_gateway::{
    config::{GatewayConfig, SAMPLE_CONFIG},
    error::ErrorBody,
    health::{HealthChecker, HealthResponse, HealthStatus},
    metrics::GatewayMetrics,
    pipeline::RequestPipeline,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Artztall Gateway - API gateway with authentication and circuit breaking
#[derive(Parser)]
#[command(name = "artztall-gateway")]
#[command(version, about = "API gateway with authentication and circuit breaking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    pipeline: Arc<RequestPipeline>,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthChecker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    let metrics = Arc::new(GatewayMetrics::new());
    let pipeline = Arc::new(RequestPipeline::from_config(&config, Arc::clone(&metrics))?);
    let health = Arc::new(HealthChecker::new(Arc::clone(pipeline.breakers())));

    let state = AppState {
        pipeline: Arc::clone(&pipeline),
        metrics,
        health,
    };

    let mut app = Router::new().route("/fallback/:name", get(fallback_handler));

    if config.health.enabled {
        let readiness_path = format!("{}/ready", config.health.path.trim_end_matches('/'));
        app = app
            .route(&config.health.path, get(health_handler))
            .route(&readiness_path, get(readiness_handler));
        info!(
            "Health endpoints enabled at {} and {}",
            config.health.path, readiness_path
        );
    }
    if config.metrics.enabled {
        app = app.route(&config.metrics.path, get(metrics_handler));
        info!("Metrics endpoint enabled at {}", config.metrics.path);
    }

    let mut app = app
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if let Some(cors) = config.cors.layer()? {
        app = app.layer(cors);
        info!("CORS enabled for {:?}", config.cors.allowed_origins);
    }

    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Starting gateway server on {}", addr);
    info!("Routes configured: {}", pipeline.routes().len());
    info!("Services configured: {}", config.services.len());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Routes: {}", config.routes.len());
            println!("Services: {}", config.services.len());
            println!();
            println!("Routes:");
            for route in &config.routes {
                let status = if route.enabled { "✓" } else { "✗" };
                let paths = route
                    .path
                    .iter()
                    .chain(route.paths.iter())
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let auth = if route.requires_auth { "auth" } else { "public" };
                println!(
                    "  {} {} [{}] → {} ({})",
                    status, route.id, paths, route.service, auth
                );
            }
            println!();
            println!("Services:");
            for (name, service) in &config.services {
                let breaker = config.breaker_config_for(name);
                println!(
                    "  {} → {} (threshold {}, cooldown {:?})",
                    name, service.address, breaker.failure_threshold, breaker.cooldown
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    std::fs::write(output_path, SAMPLE_CONFIG)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

fn health_status_code(health: &HealthResponse) -> StatusCode {
    match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    }
}

/// Liveness handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.liveness();
    (health_status_code(&health), Json(health))
}

/// Readiness handler, reports circuit states
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness();
    (health_status_code(&health), Json(health))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let output = state.metrics.prometheus_output();
    (StatusCode::OK, output)
}

/// Named fallback messages, also reachable directly
async fn fallback_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let fallbacks = state.pipeline.fallbacks();
    if fallbacks.contains(&name) {
        fallbacks.respond(&name)
    } else {
        let body = ErrorBody {
            error: format!("Unknown fallback '{}'", name),
            status: StatusCode::NOT_FOUND.as_u16(),
        };
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}

/// Gateway handler - runs every other request through the pipeline
async fn gateway_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    state.pipeline.handle(req).await
}
