//! Request pipeline
//!
//! Every request runs through a fixed list of stages:
//!
//! 1. `Classify`: public or secured path
//! 2. `Authenticate`: bearer token check, secured paths only
//! 3. `Route`: first matching route and path rewrite
//! 4. `Guard`: circuit breaker of the target service
//!
//! Each stage either continues or terminates the request with a response.
//! Requests that pass all stages are dispatched to the backend on their own
//! task, so the breaker still learns the outcome when the client goes away.

use crate::auth::{Claims, TokenValidator};
use crate::breaker::{BreakerRegistry, CircuitState, Decision, Permit};
use crate::classifier::PathClassifier;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::fallback::FallbackResponder;
use crate::metrics::GatewayMetrics;
use crate::proxy::{Forwarder, HttpForwarder, ProxyError, ServiceResolver, StaticResolver};
use crate::route::{MatchedRoute, Route, RouteTable};
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Authenticate,
    Route,
    Guard,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Classify,
        Stage::Authenticate,
        Stage::Route,
        Stage::Guard,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Authenticate => "authenticate",
            Stage::Route => "route",
            Stage::Guard => "guard",
        }
    }
}

/// Result of a single stage
pub enum StageOutcome {
    Continue,
    Terminate(Response<Body>),
}

/// Per-request state threaded through the stages
struct RequestContext {
    request: Request<Body>,
    path: String,
    secured: bool,
    claims: Option<Claims>,
    matched: Option<MatchedRoute>,
    /// Breaker admission; the breaker expects an outcome for it
    permit: Option<Permit>,
}

impl RequestContext {
    fn new(request: Request<Body>) -> Self {
        Self {
            path: request.uri().path().to_string(),
            request,
            secured: true,
            claims: None,
            matched: None,
            permit: None,
        }
    }
}

/// Everything the pipeline is built from
pub struct PipelineComponents {
    pub classifier: PathClassifier,
    pub validator: TokenValidator,
    pub routes: RouteTable,
    pub breakers: Arc<BreakerRegistry>,
    pub fallbacks: Arc<FallbackResponder>,
    pub resolver: Arc<dyn ServiceResolver>,
    pub forwarder: Arc<dyn Forwarder>,
    pub metrics: Arc<GatewayMetrics>,
    /// Backend call timeout
    pub timeout: Duration,
    /// Header receiving the token subject
    pub subject_header: Option<HeaderName>,
}

/// Drives requests through the stages and the backend call
pub struct RequestPipeline {
    classifier: PathClassifier,
    validator: TokenValidator,
    routes: RouteTable,
    breakers: Arc<BreakerRegistry>,
    fallbacks: Arc<FallbackResponder>,
    resolver: Arc<dyn ServiceResolver>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<GatewayMetrics>,
    timeout: Duration,
    subject_header: Option<HeaderName>,
}

impl RequestPipeline {
    pub fn new(components: PipelineComponents) -> Self {
        let PipelineComponents {
            classifier,
            validator,
            routes,
            breakers,
            fallbacks,
            resolver,
            forwarder,
            metrics,
            timeout,
            subject_header,
        } = components;

        Self {
            classifier,
            validator,
            routes,
            breakers,
            fallbacks,
            resolver,
            forwarder,
            metrics,
            timeout,
            subject_header,
        }
    }

    /// Build the production pipeline: static resolver and HTTP forwarder
    pub fn from_config(config: &GatewayConfig, metrics: Arc<GatewayMetrics>) -> anyhow::Result<Self> {
        let routes = RouteTable::from_config(&config.routes)?;
        let public_routes: Vec<_> = routes.public_matchers().collect();
        let classifier =
            PathClassifier::from_patterns(&config.auth.public_paths)?.with_public(public_routes);
        let subject_header = config
            .subject_header()
            .map(|h| h.parse::<HeaderName>())
            .transpose()?;

        Ok(Self::new(PipelineComponents {
            classifier,
            validator: TokenValidator::new(&config.auth.secret),
            routes,
            breakers: Arc::new(config.breaker_registry()),
            fallbacks: Arc::new(FallbackResponder::new(config.fallbacks.clone())),
            resolver: Arc::new(StaticResolver::from_config(&config.services)),
            forwarder: Arc::new(HttpForwarder::new()),
            metrics,
            timeout: config.upstream_timeout(),
            subject_header,
        }))
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn fallbacks(&self) -> &Arc<FallbackResponder> {
        &self.fallbacks
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Handle one request; always yields exactly one response
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = request.method().to_string();
        let mut ctx = RequestContext::new(request);
        let path = ctx.path.clone();

        let response = match self.run_stages(&mut ctx) {
            StageOutcome::Terminate(response) => response,
            StageOutcome::Continue => self.dispatch(ctx).await,
        };

        self.metrics
            .record_request(&method, &path, response.status().as_u16(), start.elapsed());
        response
    }

    fn run_stages(&self, ctx: &mut RequestContext) -> StageOutcome {
        for stage in Stage::ORDER {
            let outcome = match stage {
                Stage::Classify => self.classify(ctx),
                Stage::Authenticate => self.authenticate(ctx),
                Stage::Route => self.route(ctx),
                Stage::Guard => self.guard(ctx),
            };
            if let StageOutcome::Terminate(response) = outcome {
                debug!(
                    stage = stage.name(),
                    path = %ctx.path,
                    status = response.status().as_u16(),
                    "Pipeline terminated"
                );
                return StageOutcome::Terminate(response);
            }
        }
        StageOutcome::Continue
    }

    fn classify(&self, ctx: &mut RequestContext) -> StageOutcome {
        ctx.secured = self.classifier.is_secured(&ctx.path);
        StageOutcome::Continue
    }

    fn authenticate(&self, ctx: &mut RequestContext) -> StageOutcome {
        if !ctx.secured {
            return StageOutcome::Continue;
        }

        let header = ctx
            .request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match self.validator.validate(header) {
            Ok(claims) => {
                debug!(subject = %claims.subject, "Token accepted");
                ctx.claims = Some(claims);
                StageOutcome::Continue
            }
            Err(err) => {
                warn!(path = %ctx.path, reason = %err, "Authentication failed");
                self.metrics.record_auth_failure(err.label());
                StageOutcome::Terminate(GatewayError::from(err).into_response())
            }
        }
    }

    fn route(&self, ctx: &mut RequestContext) -> StageOutcome {
        match self.routes.find(&ctx.path) {
            Some(matched) => {
                debug!(
                    route = %matched.route.id,
                    upstream_path = %matched.rewritten_path,
                    "Route matched"
                );
                ctx.matched = Some(matched);
                StageOutcome::Continue
            }
            None => StageOutcome::Terminate(
                GatewayError::RouteNotFound(ctx.path.clone()).into_response(),
            ),
        }
    }

    fn guard(&self, ctx: &mut RequestContext) -> StageOutcome {
        let Some(matched) = &ctx.matched else {
            return StageOutcome::Terminate(
                GatewayError::Internal("guard stage reached without a route".to_string())
                    .into_response(),
            );
        };
        let route = &matched.route;
        let Some(policy) = &route.breaker_policy else {
            return StageOutcome::Continue;
        };

        match self.breakers.guard(&route.service) {
            Decision::Allow(permit) => {
                ctx.permit = Some(permit);
                StageOutcome::Continue
            }
            Decision::Fallback => {
                self.metrics
                    .set_circuit_state(&route.service, self.breakers.state(&route.service));
                StageOutcome::Terminate(self.fallback(&route.service, &policy.fallback))
            }
        }
    }

    async fn dispatch(&self, ctx: RequestContext) -> Response<Body> {
        let RequestContext {
            mut request,
            claims,
            matched,
            permit,
            ..
        } = ctx;
        let Some(matched) = matched else {
            return GatewayError::Internal("dispatch reached without a route".to_string())
                .into_response();
        };

        self.inject_subject(&mut request, claims.as_ref());
        let upstream = matched.upstream_path_and_query(request.uri().query());
        let route = matched.route;

        let call = BackendCall {
            resolver: Arc::clone(&self.resolver),
            forwarder: Arc::clone(&self.forwarder),
            breakers: Arc::clone(&self.breakers),
            metrics: Arc::clone(&self.metrics),
            timeout: self.timeout,
            service: route.service.clone(),
            permit,
        };

        // Runs to completion even if this handler is dropped
        match tokio::spawn(call.run(upstream, request)).await {
            Ok((outcome, state)) => self.respond(&route, outcome, state),
            Err(e) => {
                error!(service = %route.service, error = %e, "Upstream task failed");
                if let Some(permit) = permit {
                    let state = self.breakers.report_outcome(&route.service, permit, false);
                    self.metrics.set_circuit_state(&route.service, state);
                }
                GatewayError::Internal(e.to_string()).into_response()
            }
        }
    }

    fn respond(
        &self,
        route: &Route,
        outcome: Result<Response<Body>, ProxyError>,
        state: Option<CircuitState>,
    ) -> Response<Body> {
        let err = match outcome {
            Ok(response) => return response,
            Err(err) => err,
        };
        warn!(service = %route.service, route = %route.id, error = %err, "Upstream call failed");

        let error = match &err {
            ProxyError::Unresolved(_) => GatewayError::ServiceUnavailable(err.to_string()),
            ProxyError::Timeout(_) => GatewayError::BackendTimeout(err.to_string()),
            ProxyError::Io(_) => GatewayError::BackendIo(err.to_string()),
            ProxyError::InvalidRequest(_) => GatewayError::Internal(err.to_string()),
        };
        let use_fallback = match &error {
            GatewayError::ServiceUnavailable(_) | GatewayError::BackendTimeout(_) => true,
            GatewayError::BackendIo(_) => state == Some(CircuitState::Open),
            _ => false,
        };

        match &route.breaker_policy {
            Some(policy) if use_fallback => self.fallback(&route.service, &policy.fallback),
            _ => error.into_response(),
        }
    }

    fn fallback(&self, service: &str, name: &str) -> Response<Body> {
        debug!(service, fallback = name, "Serving fallback");
        self.metrics.record_fallback(service);
        self.fallbacks.respond(name)
    }

    /// Replace any client-supplied subject header with the token subject
    fn inject_subject(&self, request: &mut Request<Body>, claims: Option<&Claims>) {
        let Some(header) = &self.subject_header else {
            return;
        };
        request.headers_mut().remove(header);

        let Some(subject) = claims.map(|c| c.subject.as_str()).filter(|s| !s.is_empty()) else {
            return;
        };
        match HeaderValue::from_str(subject) {
            Ok(value) => {
                request.headers_mut().insert(header.clone(), value);
            }
            Err(e) => warn!(header = %header, error = %e, "Subject is not a valid header value"),
        }
    }
}

/// A backend call detached from the client connection
struct BackendCall {
    resolver: Arc<dyn ServiceResolver>,
    forwarder: Arc<dyn Forwarder>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<GatewayMetrics>,
    timeout: Duration,
    service: String,
    permit: Option<Permit>,
}

impl BackendCall {
    async fn run(
        self,
        upstream: String,
        request: Request<Body>,
    ) -> (Result<Response<Body>, ProxyError>, Option<CircuitState>) {
        let outcome = match self.resolver.resolve(&self.service) {
            Ok(address) => {
                let call = self.forwarder.forward(&address, &upstream, request);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::Timeout(self.timeout)),
                }
            }
            Err(e) => Err(e),
        };

        let state = self.permit.map(|permit| {
            let state = match &outcome {
                // Unsendable request, no backend outcome
                Err(ProxyError::InvalidRequest(_)) => self.breakers.release(&self.service, permit),
                Ok(response) => {
                    self.breakers
                        .report_outcome(&self.service, permit, is_success(response.status()))
                }
                Err(_) => self.breakers.report_outcome(&self.service, permit, false),
            };
            self.metrics.set_circuit_state(&self.service, state);
            state
        });

        (outcome, state)
    }
}

/// 2xx and 3xx count as healthy for the breaker
fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = Stage::ORDER.iter().map(Stage::name).collect();
        assert_eq!(names, ["classify", "authenticate", "route", "guard"]);
    }

    #[test]
    fn test_success_classification() {
        assert!(is_success(StatusCode::OK));
        assert!(is_success(StatusCode::NO_CONTENT));
        assert!(is_success(StatusCode::FOUND));
        assert!(!is_success(StatusCode::NOT_FOUND));
        assert!(!is_success(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_success(StatusCode::CONTINUE));
    }
}
