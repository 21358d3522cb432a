//! CLI commands.

pub mod admin;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod routes;

pub use admin::run_admin;
pub use auth::{run_auth, run_serve};
pub use config::run_config;
pub use gateway::run_gateway;
pub use routes::run_routes;

use std::path::{Path, PathBuf};

use anyhow::Context;
use portico_core::Config;

/// Config file in effect: the explicit path or the default location.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(Config::default_path, Path::to_path_buf)
}

/// Load and validate configuration.
///
/// An explicit path must exist; the default path falls back to built-in
/// defaults when missing.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    tracing::debug!(path = %config_path(explicit).display(), "Loading config");
    match explicit {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load_default().context("Failed to load config"),
    }
}
