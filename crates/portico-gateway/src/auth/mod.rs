//! Authentication and authorization.
//!
//! This module provides:
//! - Credential storage with an explicit account lifecycle
//! - A ledger of issued refresh and password-reset tokens
//! - JWT minting and verification
//! - Bearer-token verification for requests
//! - The static role/department/permission policy

mod jwt;
mod ledger;
mod password;
pub mod policy;
mod state;
mod users;
pub mod verifier;

pub use jwt::{Identity, TokenIssuer, TokenPair, TokenType, REFRESH_TOKEN_TTL};
pub use ledger::{TokenKind, TokenLedger, TokenRecord, fingerprint};
pub use policy::Decision;
pub use state::{AuthState, open_database};
pub use users::{AccountStatus, NewUser, ProfileUpdate, PublicUser, User, UserStore};
pub use verifier::RequireAuth;

use portico_core::FieldErrors;
use thiserror::Error;

/// Reasons a presented token is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Bad signature, malformed, wrong type, or unknown to the ledger.
    #[error("Invalid token")]
    Invalid,

    /// Past its embedded expiry.
    #[error("Token expired")]
    Expired,

    /// Explicitly revoked or already consumed.
    #[error("Token revoked")]
    Revoked,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid credentials provided.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Account exists but is not active.
    #[error("Account is {0}")]
    AccountInactive(AccountStatus),

    /// User not found.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Unique key already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lifecycle transition not allowed.
    #[error("Cannot change account from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: AccountStatus,
        /// Requested state.
        to: AccountStatus,
    },

    /// Token rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Lost a concurrent rotation of the same refresh token.
    #[error("Refresh token already rotated")]
    AlreadyRotated,

    /// Permission denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Field validation failed.
    #[error("Validation failed")]
    Validation(FieldErrors),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

impl From<sled::Error> for AuthError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<FieldErrors> for AuthError {
    fn from(errors: FieldErrors) -> Self {
        Self::Validation(errors)
    }
}
