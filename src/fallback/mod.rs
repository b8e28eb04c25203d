//! Fallback responses
//!
//! Static soft-degradation messages served with `200 OK` while a backend is
//! circuit-broken or unreachable.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use std::collections::BTreeMap;

/// Built-in fallback messages, keyed by fallback name
pub const DEFAULT_FALLBACKS: [(&str, &str); 5] = [
    (
        "user",
        "User Service is taking longer than expected. Please try again later.",
    ),
    (
        "product",
        "Product Service is taking longer than expected. Please try again later.",
    ),
    (
        "order",
        "Order Service is taking longer than expected. Please try again later.",
    ),
    (
        "payment",
        "Payment Service is taking longer than expected. Please try again later.",
    ),
    (
        "auction",
        "Auction Service is taking longer than expected. Please try again later.",
    ),
];

const GENERIC_FALLBACK: &str = "Service is taking longer than expected. Please try again later.";

/// Map of fallback names to their messages
#[derive(Debug, Clone)]
pub struct FallbackResponder {
    messages: BTreeMap<String, String>,
}

impl FallbackResponder {
    pub fn new(messages: BTreeMap<String, String>) -> Self {
        Self { messages }
    }

    pub fn message(&self, name: &str) -> Option<&str> {
        self.messages.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.messages.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }

    /// Fallback response for `name`; unknown names get a generic message
    pub fn respond(&self, name: &str) -> Response<Body> {
        text_response(self.message(name).unwrap_or(GENERIC_FALLBACK))
    }
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self::new(default_messages())
    }
}

/// The built-in messages as an owned map
pub fn default_messages() -> BTreeMap<String, String> {
    DEFAULT_FALLBACKS
        .iter()
        .map(|(name, message)| (name.to_string(), message.to_string()))
        .collect()
}

fn text_response(message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_default_messages() {
        let fallbacks = FallbackResponder::default();
        assert_eq!(fallbacks.names().count(), 5);
        assert_eq!(
            fallbacks.message("user"),
            Some("User Service is taking longer than expected. Please try again later.")
        );
        assert!(fallbacks.contains("auction"));
        assert!(!fallbacks.contains("inventory"));
    }

    #[tokio::test]
    async fn test_respond_is_ok_plain_text() {
        let fallbacks = FallbackResponder::default();
        let response = fallbacks.respond("product");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            body_text(response).await,
            "Product Service is taking longer than expected. Please try again later."
        );
    }

    #[tokio::test]
    async fn test_unknown_name_gets_generic_message() {
        let fallbacks = FallbackResponder::new(BTreeMap::new());
        let response = fallbacks.respond("inventory");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, GENERIC_FALLBACK);
    }
}
