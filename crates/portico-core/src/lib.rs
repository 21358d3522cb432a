//! # Portico Core
//!
//! Core types, configuration, and validation for Portico.
//!
//! This crate provides:
//! - Closed role, department and permission enums
//! - Configuration loading and validation (JSON5 format)
//! - Input validation and normalization

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod types;
pub mod validation;

pub use config::{
    AuthConfig, BindMode, Config, ConfigError, GatewayConfig, PathRewrite, RouteConfig,
    ServiceConfig,
};
pub use types::{Department, ParseTypeError, Permission, Requirement, Role, UserId};
pub use validation::FieldErrors;
