//! Gateway command - start the gateway and check its health.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use portico_gateway::Gateway;

use super::load_config;
use crate::ui::{self, HealthStatus};

/// Gateway actions.
#[derive(Debug, Clone)]
pub enum GatewayAction {
    /// Start the server.
    Run {
        /// Port override.
        port: Option<u16>,
    },
    /// Probe a running gateway.
    Status,
}

/// Run the gateway command.
pub async fn run_gateway(config_path: Option<&Path>, action: GatewayAction) -> Result<()> {
    match action {
        GatewayAction::Run { port } => run_gateway_server(config_path, port).await,
        GatewayAction::Status => gateway_status(config_path).await,
    }
}

async fn run_gateway_server(config_path: Option<&Path>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.gateway.port = port;
    }

    ui::header("Starting Portico Gateway");
    ui::kv(
        "Address",
        &config.gateway.bind.socket_addr(config.gateway.port)?.to_string(),
    );
    ui::kv("Routes", &config.routes.len().to_string());
    ui::info("Press Ctrl+C to stop");
    println!();

    Gateway::new(config)?.run().await?;
    Ok(())
}

async fn gateway_status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let base = format!("http://127.0.0.1:{}", config.gateway.port);

    ui::header("Gateway Status");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let body: serde_json::Value = match client.get(format!("{base}/health/backends")).send().await
    {
        Ok(resp) if resp.status().is_success() => resp.json().await?,
        Ok(resp) => {
            ui::warning(&format!("Gateway answered {}", resp.status()));
            return Ok(());
        }
        Err(_) => {
            ui::warning(&format!("Gateway is not running on port {}", config.gateway.port));
            ui::info("Start with: portico gateway run");
            return Ok(());
        }
    };

    ui::success(&format!("Gateway is running on port {}", config.gateway.port));
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        ui::kv("Status", status);
    }
    println!();

    for backend in body["backends"].as_array().into_iter().flatten() {
        let name = backend["name"].as_str().unwrap_or("?");
        let url = backend["url"].as_str().unwrap_or("?");
        let status = if backend["healthy"].as_bool().unwrap_or(false) {
            HealthStatus::Ok
        } else {
            HealthStatus::Error
        };
        let latency = backend["latencyMs"].as_u64().unwrap_or(0);
        ui::health_check(name, status, Some(&format!("{url} ({latency} ms)")));
    }

    Ok(())
}
