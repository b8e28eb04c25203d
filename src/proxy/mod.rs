//! Upstream collaborators
//!
//! This module holds the two external dependencies of the pipeline:
//! - [`ServiceResolver`]: logical service name → network address
//! - [`Forwarder`]: sends the rewritten request to that address
//!
//! The shipped implementations are a static address table and a plain-HTTP
//! hyper client.

use crate::config::ServiceConfig;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::{HeaderMap, Request, Response};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Failures of the upstream collaborators
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("service '{0}' could not be resolved")]
    Unresolved(String),

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream I/O error: {0}")]
    Io(String),

    #[error("failed to build upstream request: {0}")]
    InvalidRequest(String),
}

/// Resolves a logical service name to a base URL
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<String, ProxyError>;
}

/// Address table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }

    pub fn from_config(services: &BTreeMap<String, ServiceConfig>) -> Self {
        Self::new(
            services
                .iter()
                .map(|(name, service)| (name.clone(), service.address.clone()))
                .collect(),
        )
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, service: &str) -> Result<String, ProxyError> {
        self.addresses
            .get(service)
            .cloned()
            .ok_or_else(|| ProxyError::Unresolved(service.to_string()))
    }
}

/// Sends a request to a backend
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// `path_and_query` is already rewritten; the caller applies the timeout
    async fn forward(
        &self,
        address: &str,
        path_and_query: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError>;
}

/// hyper-based forwarder for plain HTTP backends
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
}

impl HttpForwarder {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        address: &str,
        path_and_query: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let target_url = target_url(address, path_and_query);
        let (parts, body) = request.into_parts();

        let mut builder = Request::builder().method(parts.method).uri(&target_url);

        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end_headers(&parts.headers, headers);

            // Host must name the backend, not the gateway
            match extract_host_from_url(&target_url).map(|h| h.parse::<HeaderValue>()) {
                Some(Ok(host)) => {
                    headers.insert(HOST, host);
                }
                Some(Err(e)) => warn!("Failed to use target host of '{}': {}", target_url, e),
                None => warn!(
                    "Failed to extract host from target URL '{}', Host header may be incorrect",
                    target_url
                ),
            }
        }

        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;
        let boxed_body = http_body_util::Full::new(body_bytes)
            .map_err(|e| match e {})
            .boxed();

        let upstream_request = builder
            .body(boxed_body)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .request(upstream_request)
            .await
            .map_err(|e| ProxyError::Io(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Io(format!("failed to read response body: {e}")))?
            .to_bytes();

        // The body is re-framed by the gateway
        let upstream_headers = std::mem::take(&mut parts.headers);
        copy_end_to_end_headers(&upstream_headers, &mut parts.headers);

        Ok(Response::from_parts(parts, Body::from(body_bytes)))
    }
}

fn target_url(address: &str, path_and_query: &str) -> String {
    let base = address.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

fn copy_end_to_end_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (key, value) in from.iter() {
        if !is_hop_by_hop_header(key) {
            to.append(key.clone(), value.clone());
        }
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
///
/// `host` is included because the forwarder sets it from the target URL.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Extract host and optional port from a URL string
fn extract_host_from_url(url: &str) -> Option<String> {
    url.parse::<axum::http::Uri>()
        .ok()?
        .authority()
        .map(|authority| authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};

    #[test]
    fn test_static_resolver() {
        let mut services = BTreeMap::new();
        services.insert(
            "user-service".to_string(),
            ServiceConfig {
                address: "http://127.0.0.1:8081".to_string(),
                failure_threshold: None,
                cooldown_secs: None,
            },
        );
        let resolver = StaticResolver::from_config(&services);

        assert_eq!(
            resolver.resolve("user-service").unwrap(),
            "http://127.0.0.1:8081"
        );
        assert!(matches!(
            resolver.resolve("ghost-service"),
            Err(ProxyError::Unresolved(name)) if name == "ghost-service"
        ));
    }

    #[test]
    fn test_target_url() {
        assert_eq!(
            target_url("http://localhost:8081/", "/123/profile?x=1"),
            "http://localhost:8081/123/profile?x=1"
        );
        assert_eq!(target_url("http://localhost:8081", "orders"), "http://localhost:8081/orders");
    }

    #[test]
    fn test_extract_host_from_url() {
        assert_eq!(
            extract_host_from_url("http://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_host_from_url("http://localhost:8080/path"),
            Some("localhost:8080".to_string())
        );
        assert_eq!(extract_host_from_url("/just/a/path"), None);
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut from = HeaderMap::new();
        from.insert(HOST, HeaderValue::from_static("gateway.local"));
        from.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        from.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        from.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        from.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut to = HeaderMap::new();
        copy_end_to_end_headers(&from, &mut to);

        assert_eq!(to.len(), 2);
        assert!(to.contains_key(AUTHORIZATION));
        assert!(to.contains_key(CONTENT_TYPE));
        assert!(!to.contains_key(HOST));
    }

    #[tokio::test]
    async fn test_connection_refused_is_io_error() {
        let forwarder = HttpForwarder::new();
        let request = Request::builder()
            .uri("/anything")
            .body(Body::empty())
            .unwrap();

        // Port 1 is reserved and closed on test machines
        let result = forwarder.forward("http://127.0.0.1:1", "/anything", request).await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }
}
