//! Gateway route table.

use portico_core::config::prefix_matches;
use portico_core::{Config, PathRewrite, Requirement, RouteConfig};

use crate::GatewayError;

/// A route with its target service resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Route name.
    pub name: String,
    /// Path prefix.
    pub prefix: String,
    /// Target service name.
    pub service: String,
    /// Target service base URL, without trailing slash.
    pub base_url: String,
    /// Path rewrite rule.
    pub rewrite: PathRewrite,
    /// Whether authentication is required.
    pub auth: bool,
    /// Capability required beyond authentication.
    pub requires: Option<Requirement>,
}

impl Route {
    fn resolve(route: &RouteConfig, config: &Config) -> Result<Self, GatewayError> {
        let service = config.services.get(&route.service).ok_or_else(|| {
            GatewayError::Config(format!(
                "Route '{}' references unknown service '{}'",
                route.name, route.service
            ))
        })?;
        Ok(Self {
            name: route.name.clone(),
            prefix: route.prefix.clone(),
            service: route.service.clone(),
            base_url: service.url.trim_end_matches('/').to_string(),
            rewrite: route.rewrite.clone(),
            auth: route.auth,
            requires: route.requires,
        })
    }

    /// Full upstream URL for a matched request path and optional query.
    #[must_use]
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let path = self.rewrite.apply(&self.prefix, path);
        match query {
            Some(q) if !q.is_empty() => format!("{}{path}?{q}", self.base_url),
            _ => format!("{}{path}", self.base_url),
        }
    }
}

/// Ordered, immutable list of routes. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Resolve every configured route against its service.
    ///
    /// # Errors
    ///
    /// Returns error if a route names an undeclared service.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let routes = config
            .routes
            .iter()
            .map(|r| Route::resolve(r, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { routes })
    }

    /// First route whose prefix matches `path`.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| prefix_matches(&r.prefix, path))
    }

    /// All routes in order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
