//! Config inspection command.

use std::path::Path;

use anyhow::Result;
use portico_core::Config;
use serde_json::Value;

use super::{config_path, load_config};
use crate::ui;

/// Config actions.
#[derive(Debug, Clone)]
pub enum ConfigAction {
    /// Print one value by dotted path.
    Get(String),
    /// Print the effective configuration.
    Show,
    /// Load and validate.
    Validate,
    /// Print the config file path.
    Path,
    /// Write the built-in defaults to the config path.
    Init {
        /// Overwrite an existing file.
        force: bool,
    },
}

/// Run the config command.
pub fn run_config(explicit: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", config_path(explicit).display());
            Ok(())
        }
        ConfigAction::Validate => validate_config(explicit),
        ConfigAction::Show => {
            let value = effective(explicit)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        ConfigAction::Get(key) => get_config_value(explicit, &key),
        ConfigAction::Init { force } => init_config(explicit, force),
    }
}

fn init_config(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = config_path(explicit);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(&path)?;
    ui::success(&format!("Wrote default configuration to {}", path.display()));
    Ok(())
}

/// Effective configuration as JSON, with the JWT secret masked.
fn effective(explicit: Option<&Path>) -> Result<Value> {
    let config = load_config(explicit)?;
    let mut value = serde_json::to_value(&config)?;
    if let Some(secret) = value.pointer_mut("/auth/jwtSecret") {
        if !secret.is_null() {
            *secret = Value::String("********".to_string());
        }
    }
    Ok(value)
}

fn validate_config(explicit: Option<&Path>) -> Result<()> {
    let path = config_path(explicit);
    if !path.exists() && explicit.is_none() {
        ui::info(&format!(
            "No config file at {}; built-in defaults apply",
            path.display()
        ));
    }

    match load_config(explicit) {
        Ok(config) => {
            ui::success("Configuration is valid");
            ui::kv("Services", &config.services.len().to_string());
            ui::kv("Routes", &config.routes.len().to_string());
            Ok(())
        }
        Err(e) => {
            ui::error(&format!("{e:#}"));
            Err(e)
        }
    }
}

/// Get a specific config value by dotted path (e.g. `gateway.port`).
fn get_config_value(explicit: Option<&Path>, key: &str) -> Result<()> {
    let value = effective(explicit)?;
    let mut current = &value;

    for part in key.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(part)
                .ok_or_else(|| anyhow::anyhow!("Key not found: {key}"))?,
            Value::Array(arr) => {
                let idx: usize = part
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid array index: {part}"))?;
                arr.get(idx)
                    .ok_or_else(|| anyhow::anyhow!("Index out of bounds: {part}"))?
            }
            _ => anyhow::bail!("Cannot navigate into non-object: {part}"),
        };
    }

    match current {
        Value::String(s) => println!("{s}"),
        Value::Number(n) => println!("{n}"),
        Value::Bool(b) => println!("{b}"),
        Value::Null => println!("null"),
        _ => println!("{}", serde_json::to_string_pretty(current)?),
    }

    Ok(())
}
