//! Gateway and auth service servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{FromRef, Request, State},
    response::Response,
    routing::get,
};
use futures::future::join_all;
use portico_core::{Config, GatewayConfig};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::GatewayError;
use crate::auth::{AuthState, TokenIssuer, verifier};
use crate::error::ApiError;
use crate::proxy::Upstream;
use crate::routes::RouteTable;
use crate::service;

/// A backend probed by `/health/backends`.
#[derive(Debug, Clone)]
struct Backend {
    name: String,
    url: String,
    health_url: String,
}

/// Gateway state shared across handlers. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    /// Verifies bearer tokens.
    pub issuer: Arc<TokenIssuer>,
    /// Route table.
    pub routes: Arc<RouteTable>,
    upstream: Upstream,
    backends: Arc<Vec<Backend>>,
    probe_timeout: Duration,
}

impl FromRef<GatewayState> for Arc<TokenIssuer> {
    fn from_ref(state: &GatewayState) -> Self {
        Arc::clone(&state.issuer)
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("routes", &self.routes)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

/// Gateway server.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
}

/// Builder for constructing a Gateway with its dependencies.
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    config: Option<Config>,
    issuer: Option<Arc<TokenIssuer>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing token issuer instead of loading the secret.
    #[must_use]
    pub fn with_issuer(mut self, issuer: Arc<TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Build the gateway.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the signing secret
    /// cannot be loaded.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let issuer = match self.issuer {
            Some(issuer) => issuer,
            None => Arc::new(
                TokenIssuer::from_config(&config.auth, &Config::jwt_secret_path())
                    .map_err(|e| GatewayError::Config(e.to_string()))?,
            ),
        };

        let routes = RouteTable::from_config(&config)?;
        let backends = config
            .services
            .iter()
            .map(|(name, service)| {
                let url = service.url.trim_end_matches('/').to_string();
                Backend {
                    name: name.clone(),
                    health_url: format!("{url}{}", service.health_path),
                    url,
                }
            })
            .collect();

        let state = GatewayState {
            issuer,
            routes: Arc::new(routes),
            upstream: Upstream::new(config.gateway.upstream_timeout())?,
            backends: Arc::new(backends),
            probe_timeout: config.gateway.health_probe_timeout(),
        };

        Ok(Gateway {
            config: config.gateway,
            state,
        })
    }
}

impl Gateway {
    /// Create a gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the signing secret
    /// cannot be loaded.
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        GatewayBuilder::new().with_config(config).build()
    }

    /// Shared state.
    #[must_use]
    pub const fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/health/backends", get(backends_handler))
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        if self.config.cors {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    /// Bind the configured address and serve until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self
            .config
            .bind
            .socket_addr(self.config.port)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let listener = bind(addr).await?;
        tracing::info!("Gateway listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    ///
    /// # Errors
    ///
    /// Returns error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::Server(e.to_string()))
    }
}

/// Auth service server.
#[derive(Debug)]
pub struct AuthServer {
    state: AuthState,
}

impl AuthServer {
    /// Wrap already-initialized state.
    #[must_use]
    pub const fn new(state: AuthState) -> Self {
        Self { state }
    }

    /// Open storage and load the secret from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if storage or the secret cannot be initialized.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let state = AuthState::initialize(config)
            .map_err(|e| GatewayError::Config(format!("Auth init failed: {e}")))?;
        Ok(Self::new(state))
    }

    /// Shared state.
    #[must_use]
    pub const fn state(&self) -> &AuthState {
        &self.state
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        service::router(self.state.clone())
    }

    /// Bind the configured address and serve until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self
            .state
            .config
            .bind
            .socket_addr(self.state.config.port)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let listener = bind(addr).await?;
        tracing::info!("Auth service listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    ///
    /// # Errors
    ///
    /// Returns error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::Server(e.to_string()))
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Server(format!("Failed to bind {addr}: {e}")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendHealth {
    name: String,
    url: String,
    healthy: bool,
    latency_ms: u64,
}

async fn probe(client: &reqwest::Client, backend: &Backend, timeout: Duration) -> BackendHealth {
    let started = Instant::now();
    let healthy = match client.get(&backend.health_url).timeout(timeout).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::debug!(backend = %backend.name, error = %e, "Health probe failed");
            false
        }
    };
    BackendHealth {
        name: backend.name.clone(),
        url: backend.url.clone(),
        healthy,
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

async fn backends_handler(State(state): State<GatewayState>) -> Json<Value> {
    let client = state.upstream.client();
    let results = join_all(
        state
            .backends
            .iter()
            .map(|b| probe(client, b, state.probe_timeout)),
    )
    .await;

    let status = if results.iter().all(|b| b.healthy) {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({ "status": status, "backends": results }))
}

/// Match, authenticate, authorize, forward.
async fn dispatch(
    State(state): State<GatewayState>,
    mut req: Request,
) -> Result<Response, ApiError> {
    let Some(route) = state.routes.match_path(req.uri().path()) else {
        tracing::debug!(path = %req.uri().path(), "No route");
        return Err(ApiError::NotFound("Route not found".to_string()));
    };

    if route.auth {
        let identity = verifier::authenticate(&state.issuer, req.headers())?;
        if let Some(requirement) = route.requires {
            verifier::authorize(&identity, requirement)?;
        }
        req.extensions_mut().insert(identity);
    }

    state.upstream.forward(route, req).await
}
