//! Auth service commands.

use std::path::Path;

use anyhow::Result;
use portico_gateway::AuthServer;

use super::load_config;
use crate::ui;

/// Start the auth service.
pub async fn run_auth(config_path: Option<&Path>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.auth.port = port;
    }

    ui::header("Starting Portico Auth Service");
    ui::kv(
        "Address",
        &config.auth.bind.socket_addr(config.auth.port)?.to_string(),
    );
    ui::kv("Database", &config.data_dir().display().to_string());
    println!();

    AuthServer::from_config(&config)?.run().await?;
    Ok(())
}

/// Run the gateway and the auth service together.
pub async fn run_serve(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    ui::header("Starting Portico");
    ui::kv(
        "Gateway",
        &config.gateway.bind.socket_addr(config.gateway.port)?.to_string(),
    );
    ui::kv(
        "Auth",
        &config.auth.bind.socket_addr(config.auth.port)?.to_string(),
    );
    ui::kv("Routes", &config.routes.len().to_string());
    ui::info("Press Ctrl+C to stop");
    println!();

    portico_gateway::start(config).await?;
    Ok(())
}
