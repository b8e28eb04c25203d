//! Route table module
//!
//! This module maps inbound paths to backend services:
//! - Path predicates (exact sets, `/**` prefixes, named-capture templates)
//! - Template rewriting of the upstream path
//! - First-match-wins selection in declaration order

use crate::config::RouteConfig;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while compiling route declarations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("path pattern is empty")]
    EmptyPattern,

    #[error("path pattern '{0}' must start with '/'")]
    NotAbsolute(String),

    #[error("unsupported path pattern '{0}'")]
    Unsupported(String),

    #[error("rewrite pattern '{0}' must end with a named capture such as (?<segment>.*)")]
    InvalidRewrite(String),

    #[error("route '{0}' must declare exactly one of `path` or `paths`")]
    Predicate(String),
}

/// Path predicate of a route or public path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    /// Any of the listed paths, compared verbatim
    Exact(Vec<String>),
    /// The base path itself or anything below it (`/api/users/**`)
    Prefix(String),
    /// Everything starting with `prefix`; the tail is captured under `capture`
    /// (`/api/users/(?<segment>.*)`)
    PrefixWithCapture { prefix: String, capture: String },
}

impl PathMatcher {
    /// Parse a path pattern as written in the configuration file
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RouteError::EmptyPattern);
        }
        if !pattern.starts_with('/') {
            return Err(RouteError::NotAbsolute(pattern.to_string()));
        }

        if let Some(start) = pattern.find("(?<") {
            let capture = pattern[start + 3..]
                .strip_suffix(">.*)")
                .filter(|name| is_capture_name(name))
                .ok_or_else(|| RouteError::Unsupported(pattern.to_string()))?;
            return Ok(PathMatcher::PrefixWithCapture {
                prefix: pattern[..start].to_string(),
                capture: capture.to_string(),
            });
        }

        if let Some(base) = pattern.strip_suffix("/**") {
            if base.contains('*') {
                return Err(RouteError::Unsupported(pattern.to_string()));
            }
            return Ok(PathMatcher::Prefix(base.to_string()));
        }

        if pattern.contains('*') || pattern.contains('(') {
            return Err(RouteError::Unsupported(pattern.to_string()));
        }

        Ok(PathMatcher::Exact(vec![pattern.to_string()]))
    }

    /// Build an exact matcher from a list of literal paths
    pub fn exact<I, S>(paths: I) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths
            .into_iter()
            .map(Into::into)
            .map(|p: String| {
                if p.starts_with('/') {
                    Ok(p)
                } else {
                    Err(RouteError::NotAbsolute(p))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        if paths.is_empty() {
            return Err(RouteError::EmptyPattern);
        }
        Ok(PathMatcher::Exact(paths))
    }

    /// Check whether the matcher accepts the path (query string excluded)
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(paths) => paths.iter().any(|p| p == path),
            PathMatcher::Prefix(base) => path
                .strip_prefix(base.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
            PathMatcher::PrefixWithCapture { prefix, .. } => path.starts_with(prefix.as_str()),
        }
    }

    /// Captured tail of a template matcher
    pub fn captured<'a>(&self, path: &'a str) -> Option<&'a str> {
        match self {
            PathMatcher::PrefixWithCapture { prefix, .. } => path.strip_prefix(prefix.as_str()),
            _ => None,
        }
    }
}

fn is_capture_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Template rewrite: `/api/users/(?<segment>.*)` → `/${segment}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    matcher: PathMatcher,
    placeholder: String,
    replacement: String,
}

impl RewriteRule {
    /// Compile a rewrite rule; the pattern must be a capture template
    pub fn parse(pattern: &str, replacement: &str) -> Result<Self, RouteError> {
        let matcher = PathMatcher::parse(pattern)?;
        let PathMatcher::PrefixWithCapture { capture, .. } = &matcher else {
            return Err(RouteError::InvalidRewrite(pattern.to_string()));
        };
        let placeholder = format!("${{{capture}}}");

        Ok(Self {
            matcher,
            placeholder,
            replacement: replacement.to_string(),
        })
    }

    /// Rewrite the path, or `None` when the template does not apply
    pub fn apply(&self, path: &str) -> Option<String> {
        let tail = self.matcher.captured(path)?;
        let rewritten = self.replacement.replace(&self.placeholder, tail);
        if rewritten.starts_with('/') {
            Some(rewritten)
        } else {
            Some(format!("/{rewritten}"))
        }
    }
}

/// Reference to the breaker protection of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerPolicyRef {
    /// Fallback responder used while the service's circuit is open
    pub fallback: String,
}

/// A compiled route
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub matcher: PathMatcher,
    pub rewrite: Option<RewriteRule>,
    /// Logical service name handed to the resolver
    pub service: String,
    pub requires_auth: bool,
    /// `None` leaves the route unguarded
    pub breaker_policy: Option<BreakerPolicyRef>,
}

impl Route {
    /// Compile a route declaration
    pub fn from_config(config: &RouteConfig) -> Result<Self, RouteError> {
        let matcher = match (&config.path, config.paths.is_empty()) {
            (Some(path), true) => PathMatcher::parse(path)?,
            (None, false) => PathMatcher::exact(config.paths.iter().cloned())?,
            _ => return Err(RouteError::Predicate(config.id.clone())),
        };

        let rewrite = config
            .rewrite
            .as_ref()
            .map(|r| RewriteRule::parse(&r.pattern, &r.replacement))
            .transpose()?;

        Ok(Self {
            id: config.id.clone(),
            matcher,
            rewrite,
            service: config.service.clone(),
            requires_auth: config.requires_auth,
            breaker_policy: config.fallback.as_ref().map(|fallback| BreakerPolicyRef {
                fallback: fallback.clone(),
            }),
        })
    }

    /// Upstream path for an accepted inbound path
    pub fn rewrite_path(&self, path: &str) -> String {
        self.rewrite
            .as_ref()
            .and_then(|rule| rule.apply(path))
            .unwrap_or_else(|| path.to_string())
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct MatchedRoute {
    pub route: Arc<Route>,
    pub rewritten_path: String,
}

impl MatchedRoute {
    /// Upstream path with the original query string carried over verbatim
    pub fn upstream_path_and_query(&self, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.rewritten_path, q),
            _ => self.rewritten_path.clone(),
        }
    }
}

/// Ordered route table; the first accepting route wins
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Compile enabled route declarations, keeping their order
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, RouteError> {
        let routes = routes
            .iter()
            .filter(|r| r.enabled)
            .map(Route::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(routes))
    }

    /// Find the first route accepting `path` and rewrite it
    pub fn find(&self, path: &str) -> Option<MatchedRoute> {
        self.routes
            .iter()
            .find(|route| route.matcher.matches(path))
            .map(|route| MatchedRoute {
                rewritten_path: route.rewrite_path(path),
                route: Arc::clone(route),
            })
    }

    /// Predicates of routes that do not require authentication
    pub fn public_matchers(&self) -> impl Iterator<Item = PathMatcher> + '_ {
        self.routes
            .iter()
            .filter(|r| !r.requires_auth)
            .map(|r| r.matcher.clone())
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, pattern: &str, service: &str) -> Route {
        Route {
            id: id.to_string(),
            matcher: PathMatcher::parse(pattern).unwrap(),
            rewrite: None,
            service: service.to_string(),
            requires_auth: true,
            breaker_policy: None,
        }
    }

    fn users_route() -> Route {
        Route {
            rewrite: Some(RewriteRule::parse("/api/users/(?<segment>.*)", "/${segment}").unwrap()),
            ..route("user-service", "/api/users/**", "user-service")
        }
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            PathMatcher::parse("/api/users/**").unwrap(),
            PathMatcher::Prefix("/api/users".to_string())
        );
        assert_eq!(
            PathMatcher::parse("/api/auth/login").unwrap(),
            PathMatcher::Exact(vec!["/api/auth/login".to_string()])
        );
        assert_eq!(
            PathMatcher::parse("/api/v1/auth/(?<segment>.*)").unwrap(),
            PathMatcher::PrefixWithCapture {
                prefix: "/api/v1/auth/".to_string(),
                capture: "segment".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_patterns() {
        assert_eq!(PathMatcher::parse(""), Err(RouteError::EmptyPattern));
        assert!(matches!(
            PathMatcher::parse("api/users"),
            Err(RouteError::NotAbsolute(_))
        ));
        assert!(matches!(
            PathMatcher::parse("/api/*/users"),
            Err(RouteError::Unsupported(_))
        ));
        assert!(matches!(
            PathMatcher::parse("/api/(?<seg>[0-9]+)"),
            Err(RouteError::Unsupported(_))
        ));
        assert!(matches!(
            RewriteRule::parse("/api/users/**", "/"),
            Err(RouteError::InvalidRewrite(_))
        ));
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let matcher = PathMatcher::parse("/api/users/**").unwrap();
        assert!(matcher.matches("/api/users"));
        assert!(matcher.matches("/api/users/"));
        assert!(matcher.matches("/api/users/123/profile"));
        assert!(!matcher.matches("/api/usersettings"));
        assert!(!matcher.matches("/api"));
    }

    #[test]
    fn test_exact_set() {
        let matcher =
            PathMatcher::exact(["/api/v1/auth/register", "/api/v1/auth/authenticate"]).unwrap();
        assert!(matcher.matches("/api/v1/auth/register"));
        assert!(matcher.matches("/api/v1/auth/authenticate"));
        assert!(!matcher.matches("/api/v1/auth/register/extra"));
        assert!(PathMatcher::exact(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_rewrite_strips_prefix() {
        let table = RouteTable::new(vec![users_route()]);
        let matched = table.find("/api/users/123/profile").unwrap();
        assert_eq!(matched.route.id, "user-service");
        assert_eq!(matched.rewritten_path, "/123/profile");
    }

    #[test]
    fn test_rewrite_keeps_path_when_template_does_not_apply() {
        let table = RouteTable::new(vec![users_route()]);
        let matched = table.find("/api/users").unwrap();
        assert_eq!(matched.rewritten_path, "/api/users");

        let matched = table.find("/api/users/").unwrap();
        assert_eq!(matched.rewritten_path, "/");
    }

    #[test]
    fn test_rewrite_preserves_query_and_encoding() {
        let table = RouteTable::new(vec![users_route()]);
        let matched = table.find("/api/users/search%20term/a%2Fb").unwrap();
        assert_eq!(matched.rewritten_path, "/search%20term/a%2Fb");
        assert_eq!(
            matched.upstream_path_and_query(Some("page=1&q=a%26b")),
            "/search%20term/a%2Fb?page=1&q=a%26b"
        );
        assert_eq!(matched.upstream_path_and_query(Some("")), "/search%20term/a%2Fb");
        assert_eq!(matched.upstream_path_and_query(None), "/search%20term/a%2Fb");
    }

    #[test]
    fn test_first_match_wins() {
        let artisans = Route {
            requires_auth: false,
            ..route("artisans", "/api/users/artisans/**", "artisan-service")
        };
        let table = RouteTable::new(vec![artisans, users_route()]);

        assert_eq!(table.find("/api/users/artisans/7").unwrap().route.id, "artisans");
        assert_eq!(table.find("/api/users/7").unwrap().route.id, "user-service");

        // Declared the other way round, the broad route shadows the narrow one
        let table = RouteTable::new(vec![
            users_route(),
            route("artisans", "/api/users/artisans/**", "artisan-service"),
        ]);
        assert_eq!(table.find("/api/users/artisans/7").unwrap().route.id, "user-service");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::new(vec![users_route()]);
        assert!(table.find("/api/unknown/path").is_none());
        assert!(RouteTable::default().find("/api/users/1").is_none());
    }

    #[test]
    fn test_public_matchers() {
        let public = Route {
            requires_auth: false,
            ..route("public", "/api/v1/auth/register", "user-service")
        };
        let table = RouteTable::new(vec![public, users_route()]);
        let matchers: Vec<_> = table.public_matchers().collect();
        assert_eq!(matchers.len(), 1);
        assert!(matchers[0].matches("/api/v1/auth/register"));
    }

    #[test]
    fn test_from_config_requires_single_predicate() {
        let config = RouteConfig {
            id: "broken".to_string(),
            path: Some("/api/x/**".to_string()),
            paths: vec!["/api/x".to_string()],
            rewrite: None,
            service: "x".to_string(),
            requires_auth: true,
            fallback: None,
            enabled: true,
            description: None,
        };
        assert_eq!(
            Route::from_config(&config).unwrap_err(),
            RouteError::Predicate("broken".to_string())
        );

        let config = RouteConfig {
            path: None,
            paths: vec![],
            ..config
        };
        assert!(Route::from_config(&config).is_err());
    }
}
