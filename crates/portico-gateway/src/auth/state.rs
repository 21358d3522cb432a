//! Shared state of the auth service.

use std::path::Path;
use std::sync::Arc;

use axum::extract::FromRef;
use portico_core::{AuthConfig, Config};

use super::AuthError;
use super::jwt::TokenIssuer;
use super::ledger::TokenLedger;
use super::users::UserStore;
use crate::middleware::LoginRateLimiter;

/// Shared authentication state. Cheap to clone.
#[derive(Clone)]
pub struct AuthState {
    /// Auth configuration.
    pub config: Arc<AuthConfig>,
    /// Token issuer.
    pub issuer: Arc<TokenIssuer>,
    /// User store.
    pub users: UserStore,
    /// Token ledger.
    pub ledger: TokenLedger,
    /// Login throttle.
    pub login_limiter: Arc<LoginRateLimiter>,
}

impl AuthState {
    /// Assemble state from already-open parts.
    ///
    /// # Errors
    ///
    /// Returns error if the storage trees cannot be opened.
    pub fn new(config: AuthConfig, issuer: TokenIssuer, db: &sled::Db) -> Result<Self, AuthError> {
        let login_limiter = LoginRateLimiter::new(config.login_attempts_per_minute);
        Ok(Self {
            users: UserStore::new(db)?,
            ledger: TokenLedger::new(db)?,
            issuer: Arc::new(issuer),
            login_limiter: Arc::new(login_limiter),
            config: Arc::new(config),
        })
    }

    /// Open storage and resolve the signing secret from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or the secret is
    /// unusable.
    pub fn initialize(config: &Config) -> Result<Self, AuthError> {
        let db = open_database(&config.data_dir())?;
        let issuer = TokenIssuer::from_config(&config.auth, &Config::jwt_secret_path())?;
        Self::new(config.auth.clone(), issuer, &db)
    }
}

/// Open (or create) the auth database directory.
///
/// # Errors
///
/// Returns error if sled cannot open the directory.
pub fn open_database(path: &Path) -> Result<sled::Db, AuthError> {
    sled::open(path.join("auth"))
        .map_err(|e| AuthError::Storage(format!("Failed to open auth database: {e}")))
}

impl FromRef<AuthState> for Arc<TokenIssuer> {
    fn from_ref(state: &AuthState) -> Self {
        Arc::clone(&state.issuer)
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("users", &self.users)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}
