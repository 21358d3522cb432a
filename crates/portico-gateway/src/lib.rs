//! # Portico Gateway
//!
//! Authenticating API gateway in front of departmental backend services,
//! plus the auth service that issues the tokens it verifies.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and authorization.
pub mod auth;
/// Error envelope.
pub mod error;
mod middleware;
/// Upstream forwarding.
pub mod proxy;
/// Route table.
pub mod routes;
mod server;
/// Auth service HTTP API.
pub mod service;

pub use auth::{AuthError, AuthState, Identity, TokenIssuer, User, UserStore};
pub use error::{ApiError, ApiResult};
pub use middleware::LoginRateLimiter;
pub use routes::{Route, RouteTable};
pub use server::{AuthServer, Gateway, GatewayBuilder, GatewayState};

use portico_core::Config;

/// Run the gateway and the auth service in one process.
///
/// Returns when either server stops.
///
/// # Errors
///
/// Returns error if either server fails to start or stops with an error.
pub async fn start(config: Config) -> Result<(), GatewayError> {
    let auth = AuthServer::from_config(&config)?;
    let gateway = GatewayBuilder::new()
        .with_issuer(std::sync::Arc::clone(&auth.state().issuer))
        .with_config(config)
        .build()?;

    tokio::select! {
        result = auth.run() => result,
        result = gateway.run() => result,
    }
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Server error.
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}
