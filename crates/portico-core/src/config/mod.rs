//! Configuration loading and validation.
//!
//! JSON5 format, camelCase keys.
//! Config location: `~/.portico/portico.json`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::{Department, Permission, Requirement};

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "PORTICO_STATE_DIR";
/// Environment variable overriding the JWT signing secret.
pub const JWT_SECRET_ENV: &str = "PORTICO_JWT_SECRET";
/// Environment variable overriding the gateway port.
pub const GATEWAY_PORT_ENV: &str = "PORTICO_GATEWAY_PORT";
/// Environment variable overriding the auth service port.
pub const AUTH_PORT_ENV: &str = "PORTICO_AUTH_PORT";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway (dispatcher) configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Auth service configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backend services by name.
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Ordered route table. First matching prefix wins.
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            services: default_services(),
            routes: default_routes(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// A missing file yields the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default().with_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific path, applying env overrides.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json5(&content)?.with_env_overrides();
        config.validate()?;
        tracing::debug!(path = %path.display(), routes = config.routes.len(), "Loaded config");
        Ok(config)
    }

    /// Parse configuration text without env overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON5 for this schema.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("portico.json")
    }

    /// Get the Portico state directory.
    ///
    /// Uses `PORTICO_STATE_DIR` env var if set, otherwise `~/.portico`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".portico")
        } else {
            PathBuf::from(".portico")
        }
    }

    /// Directory holding the auth service's sled database.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.auth
            .data_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("data"))
    }

    /// Path of the persisted JWT secret used when none is configured.
    #[must_use]
    pub fn jwt_secret_path() -> PathBuf {
        Self::state_dir().join("jwt-secret")
    }

    /// Apply overrides from process environment variables.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Unparseable port values are ignored with a warning.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secret) = lookup(JWT_SECRET_ENV) {
            self.auth.jwt_secret = Some(secret);
        }

        for (key, slot) in [
            (GATEWAY_PORT_ENV, &mut self.gateway.port),
            (AUTH_PORT_ENV, &mut self.auth.port),
        ] {
            if let Some(raw) = lookup(key) {
                match raw.parse::<u16>() {
                    Ok(port) => *slot = port,
                    Err(_) => tracing::warn!(var = key, value = %raw, "Ignoring invalid port override"),
                }
            }
        }

        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(invalid("Gateway port cannot be 0"));
        }
        if self.auth.port == 0 {
            return Err(invalid("Auth port cannot be 0"));
        }
        if self.auth.access_token_ttl_secs == 0 {
            return Err(invalid("auth.accessTokenTtlSecs must be positive"));
        }
        if self.auth.login_attempts_per_minute == 0 {
            return Err(invalid("auth.loginAttemptsPerMinute must be positive"));
        }

        for (name, service) in &self.services {
            service.validate(name)?;
        }

        for (i, route) in self.routes.iter().enumerate() {
            route.validate()?;

            if !self.services.contains_key(&route.service) {
                return Err(invalid(format!(
                    "Route '{}' references unknown service '{}'",
                    route.name, route.service
                )));
            }

            for earlier in &self.routes[..i] {
                if earlier.name == route.name {
                    return Err(invalid(format!("Duplicate route name '{}'", route.name)));
                }
                if prefix_matches(&earlier.prefix, &route.prefix)
                    || prefix_matches(&route.prefix, &earlier.prefix)
                {
                    return Err(invalid(format!(
                        "Ambiguous routes: '{}' ({}) overlaps '{}' ({})",
                        route.name, route.prefix, earlier.name, earlier.prefix
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Whether `prefix` matches `path` on a path-segment boundary.
///
/// `/api/informatica` matches `/api/informatica` and `/api/informatica/x`
/// but not `/api/informaticax`.
#[must_use]
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address mode.
    #[serde(default)]
    pub bind: BindMode,

    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Per-request timeout for forwarded calls, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Timeout of a single backend health probe, in milliseconds.
    #[serde(default = "default_probe_timeout")]
    pub health_probe_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: BindMode::default(),
            cors: true,
            upstream_timeout_secs: default_upstream_timeout(),
            health_probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Upstream timeout as a `Duration`.
    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Health probe timeout as a `Duration`.
    #[must_use]
    pub const fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }
}

const fn default_gateway_port() -> u16 {
    4000
}

const fn default_auth_port() -> u16 {
    4001
}

const fn default_upstream_timeout() -> u64 {
    60
}

const fn default_probe_timeout() -> u64 {
    2000
}

const fn default_true() -> bool {
    true
}

/// Server bind mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to localhost only.
    #[default]
    Local,
    /// Bind to all interfaces.
    Public,
    /// Custom bind address.
    Custom(String),
}

impl BindMode {
    /// Socket address for this mode and port.
    ///
    /// # Errors
    ///
    /// Returns error if a custom address is not an IP address.
    pub fn socket_addr(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        let ip = match self {
            Self::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Public => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Custom(addr) => addr
                .parse()
                .map_err(|_| invalid(format!("Invalid bind address '{addr}'")))?,
        };
        Ok(SocketAddr::new(ip, port))
    }
}

/// Auth service configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Port to listen on.
    #[serde(default = "default_auth_port")]
    pub port: u16,

    /// Bind address mode.
    #[serde(default)]
    pub bind: BindMode,

    /// Database directory. Defaults to `<stateDir>/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// JWT secret (hex-encoded). Falls back to the persisted secret file.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,

    /// Password-reset token lifetime in seconds.
    #[serde(default = "default_reset_ttl")]
    pub reset_token_ttl_secs: u64,

    /// Return minted reset tokens in the forgot-password response.
    #[serde(default)]
    pub expose_reset_tokens: bool,

    /// Login attempts allowed per identifier per minute.
    #[serde(default = "default_login_attempts")]
    pub login_attempts_per_minute: u32,

    /// Handler timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors: bool,
}

const fn default_access_ttl() -> u64 {
    3600
}

const fn default_reset_ttl() -> u64 {
    3600
}

const fn default_login_attempts() -> u32 {
    10
}

const fn default_request_timeout() -> u64 {
    30
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            port: default_auth_port(),
            bind: BindMode::default(),
            data_dir: None,
            jwt_secret: None,
            access_token_ttl_secs: default_access_ttl(),
            reset_token_ttl_secs: default_reset_ttl(),
            expose_reset_tokens: false,
            login_attempts_per_minute: default_login_attempts(),
            request_timeout_secs: default_request_timeout(),
            cors: true,
        }
    }
}

impl AuthConfig {
    /// Create a new auth config builder.
    #[must_use]
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Access token lifetime as a `Duration`.
    #[must_use]
    pub const fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Reset token lifetime as a `Duration`.
    #[must_use]
    pub const fn reset_token_ttl(&self) -> Duration {
        Duration::from_secs(self.reset_token_ttl_secs)
    }

    /// Handler timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("port", &self.port)
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "********"))
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("reset_token_ttl_secs", &self.reset_token_ttl_secs)
            .field("expose_reset_tokens", &self.expose_reset_tokens)
            .field("login_attempts_per_minute", &self.login_attempts_per_minute)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("cors", &self.cors)
            .finish()
    }
}

/// Builder for `AuthConfig`.
#[derive(Debug, Default)]
pub struct AuthConfigBuilder {
    config: AuthConfig,
}

impl AuthConfigBuilder {
    /// Set the database directory.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// Set the access token lifetime.
    #[must_use]
    pub const fn access_token_ttl_secs(mut self, secs: u64) -> Self {
        self.config.access_token_ttl_secs = secs;
        self
    }

    /// Return reset tokens in forgot-password responses.
    #[must_use]
    pub const fn expose_reset_tokens(mut self, expose: bool) -> Self {
        self.config.expose_reset_tokens = expose;
        self
    }

    /// Set the login throttle.
    #[must_use]
    pub const fn login_attempts_per_minute(mut self, n: u32) -> Self {
        self.config.login_attempts_per_minute = n;
        self
    }

    /// Build the config.
    #[must_use]
    pub fn build(self) -> AuthConfig {
        self.config
    }
}

/// A backend service the gateway can forward to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Base URL, e.g. `http://localhost:4002`.
    pub url: String,

    /// Path probed by `/health/backends`.
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceConfig {
    /// Service at `url` with the default health path.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            health_path: default_health_path(),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| invalid(format!("Service '{name}' has invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "Service '{name}' url must be http or https"
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(invalid(format!(
                "Service '{name}' healthPath must start with '/'"
            )));
        }
        Ok(())
    }
}

/// How a matched prefix is rewritten before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PathRewrite {
    /// Forward the path unchanged.
    #[default]
    Preserve,
    /// Swap the matched prefix for `target`.
    Replace {
        /// Replacement prefix, e.g. `/api/tickets`.
        target: String,
    },
}

impl PathRewrite {
    /// Rewrite `path`, which must match `prefix`.
    #[must_use]
    pub fn apply(&self, prefix: &str, path: &str) -> String {
        match self {
            Self::Preserve => path.to_string(),
            Self::Replace { target } => {
                let rest = if prefix == "/" {
                    path
                } else {
                    path.strip_prefix(prefix).unwrap_or(path)
                };
                let base = target.trim_end_matches('/');
                match (base.is_empty(), rest.is_empty()) {
                    (true, true) => "/".to_string(),
                    (true, false) => rest.to_string(),
                    (false, _) => format!("{base}{rest}"),
                }
            }
        }
    }
}

/// One entry of the gateway route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Route name, used in logs.
    pub name: String,

    /// Path prefix, matched on segment boundaries.
    pub prefix: String,

    /// Name of the target service.
    pub service: String,

    /// Path rewrite rule.
    #[serde(default)]
    pub rewrite: PathRewrite,

    /// Whether a valid access token is required.
    #[serde(default)]
    pub auth: bool,

    /// Capability required beyond authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requirement>,
}

impl RouteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.prefix.starts_with('/') {
            return Err(invalid(format!(
                "Route '{}' prefix must start with '/'",
                self.name
            )));
        }
        if self.prefix.len() > 1 && self.prefix.ends_with('/') {
            return Err(invalid(format!(
                "Route '{}' prefix must not end with '/'",
                self.name
            )));
        }
        if self.requires.is_some() && !self.auth {
            return Err(invalid(format!(
                "Route '{}' declares a capability but does not require auth",
                self.name
            )));
        }
        if let PathRewrite::Replace { target } = &self.rewrite {
            if !target.starts_with('/') {
                return Err(invalid(format!(
                    "Route '{}' rewrite target must start with '/'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn route(
    name: &str,
    prefix: &str,
    target: &str,
    auth: bool,
    requires: Option<Requirement>,
) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        prefix: prefix.to_string(),
        service: name.to_string(),
        rewrite: PathRewrite::Replace {
            target: target.to_string(),
        },
        auth,
        requires,
    }
}

/// Built-in route table.
#[must_use]
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        route("auth", "/auth", "/api/auth", false, None),
        route("tickets", "/tickets", "/api/tickets", true, None),
        route("calendar", "/calendar", "/", false, None),
        route(
            "informatica",
            "/api/informatica",
            "/api",
            true,
            Some(Requirement::Department(Department::Informatica)),
        ),
        route(
            "laboratorio",
            "/api/laboratorio",
            "/api",
            true,
            Some(Requirement::Department(Department::Laboratorio)),
        ),
        route("inventory", "/inventory", "/api/inventory", true, None),
        route("requests", "/requests", "/api/requests", true, None),
        route(
            "reports",
            "/reports",
            "/api/reports",
            true,
            Some(Requirement::Permission(Permission::ViewReports)),
        ),
    ]
}

/// Built-in services on localhost.
#[must_use]
pub fn default_services() -> BTreeMap<String, ServiceConfig> {
    [
        ("auth", 4001),
        ("tickets", 4002),
        ("calendar", 4003),
        ("informatica", 4004),
        ("laboratorio", 4005),
        ("inventory", 4006),
        ("requests", 4007),
        ("reports", 4008),
    ]
    .into_iter()
    .map(|(name, port)| {
        (
            name.to_string(),
            ServiceConfig::new(format!("http://localhost:{port}")),
        )
    })
    .collect()
}
