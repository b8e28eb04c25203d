//! Path classification
//!
//! Decides whether a request path needs a bearer token. The decision is made
//! before any token is looked at, so public paths never fail authentication.

use crate::route::{PathMatcher, RouteError};

/// Public paths used when the configuration does not list any
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &[
    "/api/auth/login",
    "/api/auth/signup",
    "/api/auth/verify/**",
    "/api/public/**",
    "/api/products/**",
];

/// Allowlist of public path predicates
#[derive(Debug, Clone)]
pub struct PathClassifier {
    public: Vec<PathMatcher>,
}

impl PathClassifier {
    pub fn new(public: Vec<PathMatcher>) -> Self {
        Self { public }
    }

    /// Build a classifier from configured patterns
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, RouteError> {
        let public = patterns
            .iter()
            .map(|p| PathMatcher::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(public))
    }

    /// Add more public predicates, e.g. those of routes declared without auth
    pub fn with_public<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = PathMatcher>,
    {
        self.public.extend(extra);
        self
    }

    /// `false` iff any public predicate accepts the path
    pub fn is_secured(&self, path: &str) -> bool {
        !self.public.iter().any(|matcher| matcher.matches(path))
    }

    pub fn public_predicates(&self) -> &[PathMatcher] {
        &self.public
    }
}

impl Default for PathClassifier {
    fn default() -> Self {
        // The defaults are literals known to parse
        Self::from_patterns(DEFAULT_PUBLIC_PATHS).unwrap_or_else(|_| Self::new(Vec::new()))
    }
}
