//! Print the route table.

use std::path::Path;

use anyhow::Result;
use portico_core::PathRewrite;

use super::load_config;
use crate::ui;

/// Print every route with its target and access rule.
pub fn run_routes(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    ui::header("Routes");
    println!();
    ui::table_row(&[
        ("PREFIX", 20),
        ("SERVICE", 14),
        ("TARGET", 36),
        ("ACCESS", 24),
    ]);
    println!("{}", "-".repeat(94));

    for route in &config.routes {
        let base = config
            .services
            .get(&route.service)
            .map_or("?", |s| s.url.as_str());
        let target = match &route.rewrite {
            PathRewrite::Preserve => format!("{base}{}", route.prefix),
            PathRewrite::Replace { target } => format!("{base}{target}"),
        };
        let access = match (route.auth, route.requires) {
            (false, _) => "public".to_string(),
            (true, None) => "bearer".to_string(),
            (true, Some(requirement)) => requirement.to_string(),
        };
        ui::table_row(&[
            (route.prefix.as_str(), 20),
            (route.service.as_str(), 14),
            (target.as_str(), 36),
            (access.as_str(), 24),
        ]);
    }

    Ok(())
}
