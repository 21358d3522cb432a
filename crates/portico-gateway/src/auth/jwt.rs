//! JWT token management.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use portico_core::{AuthConfig, Department, Role, UserId};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::ledger::{TokenKind, TokenLedger};
use super::users::{User, UserStore};
use super::{AuthError, TokenError};

/// Lifetime of refresh tokens.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Token type, carried in the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Access token for API calls.
    Access,
    /// Refresh token for getting new token pairs.
    Refresh,
    /// Single-use password reset token.
    ResetPassword,
}

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    username: String,
    role: Role,
    department: Department,
    iat: i64,
    exp: i64,
    jti: String,
    typ: TokenType,
}

/// Refresh and reset token claims. Identity is re-read from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
    typ: TokenType,
}

/// Verified caller identity, as embedded in an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User ID.
    pub user_id: UserId,
    /// Username.
    pub username: String,
    /// Role at issuance time.
    pub role: Role,
    /// Department at issuance time.
    pub department: Department,
}

/// A pair of access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Access token expiration.
    pub expires_at: DateTime<Utc>,
    /// Refresh token expiration.
    pub refresh_expires_at: DateTime<Utc>,
    /// Token type (always "Bearer").
    pub token_type: String,
}

/// Mints and verifies signed tokens. Never touches storage when minting.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    reset_ttl: Duration,
}

impl TokenIssuer {
    /// Create a new issuer with a secret key.
    ///
    /// The secret should be at least 32 bytes.
    #[must_use]
    pub fn new(secret: &[u8], access_ttl: Duration, reset_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl,
            reset_ttl,
        }
    }

    /// Create an issuer from a hex-encoded secret.
    ///
    /// # Errors
    ///
    /// Returns error if hex decoding fails.
    pub fn from_hex_secret(
        hex_secret: &str,
        access_ttl: Duration,
        reset_ttl: Duration,
    ) -> Result<Self, AuthError> {
        let secret = hex::decode(hex_secret.trim())
            .map_err(|e| AuthError::Config(format!("Invalid hex secret: {e}")))?;
        if secret.len() < 32 {
            return Err(AuthError::Config(
                "JWT secret must be at least 256 bits".to_string(),
            ));
        }
        Ok(Self::new(&secret, access_ttl, reset_ttl))
    }

    /// Build an issuer from auth settings.
    ///
    /// Uses `auth.jwtSecret` (already merged with `PORTICO_JWT_SECRET`) when
    /// set, otherwise the secret persisted at `secret_path`, generating and
    /// writing one on first use.
    ///
    /// # Errors
    ///
    /// Returns error if the secret is malformed or the file cannot be used.
    pub fn from_config(config: &AuthConfig, secret_path: &Path) -> Result<Self, AuthError> {
        let hex_secret = match &config.jwt_secret {
            Some(secret) => secret.clone(),
            None => load_or_create_secret(secret_path)?,
        };
        Self::from_hex_secret(
            &hex_secret,
            config.access_token_ttl(),
            config.reset_token_ttl(),
        )
    }

    /// Generate a random 256-bit secret key.
    #[must_use]
    pub fn generate_secret() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// Generate a random secret as hex string.
    #[must_use]
    pub fn generate_hex_secret() -> String {
        hex::encode(Self::generate_secret())
    }

    /// Access token lifetime.
    #[must_use]
    pub const fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Mint an access/refresh pair for a user.
    ///
    /// # Errors
    ///
    /// Returns error if token encoding fails.
    pub fn mint(&self, user: &User) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let expires_at = now + to_chrono(self.access_ttl);
        let access = AccessClaims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role,
            department: user.department,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: random_jti(),
            typ: TokenType::Access,
        };
        let access_token = self.sign(&access)?;

        let (refresh_token, refresh_expires_at) =
            self.mint_session(user.id, TokenType::Refresh, REFRESH_TOKEN_TTL)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at,
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        })
    }

    /// Mint a password-reset token.
    ///
    /// # Errors
    ///
    /// Returns error if token encoding fails.
    pub fn mint_reset(&self, user_id: UserId) -> Result<(String, DateTime<Utc>), AuthError> {
        self.mint_session(user_id, TokenType::ResetPassword, self.reset_ttl)
    }

    fn mint_session(
        &self,
        user_id: UserId,
        typ: TokenType,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let now = Utc::now();
        let exp = now + to_chrono(ttl);
        let claims = SessionClaims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: random_jti(),
            typ,
        };
        Ok((self.sign(&claims)?, exp))
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Config(format!("Token encoding failed: {e}")))
    }

    /// Verify an access token's signature, expiry and type.
    ///
    /// # Errors
    ///
    /// Returns `Expired` past `exp`, otherwise `Invalid` for any defect.
    pub fn verify_access(&self, token: &str) -> Result<Identity, TokenError> {
        let claims: AccessClaims = decode(token, &self.decoding_key, &self.validation)
            .map_err(map_jwt_error)?
            .claims;

        if claims.typ != TokenType::Access {
            return Err(TokenError::Invalid);
        }

        Ok(Identity {
            user_id: parse_subject(&claims.sub)?,
            username: claims.username,
            role: claims.role,
            department: claims.department,
        })
    }

    /// Decode a refresh or reset token without consulting storage.
    ///
    /// # Errors
    ///
    /// Returns `Expired` past `exp`, `Invalid` for a bad signature or type.
    pub fn decode_session(&self, token: &str, expected: TokenType) -> Result<UserId, TokenError> {
        let claims: SessionClaims = decode(token, &self.decoding_key, &self.validation)
            .map_err(map_jwt_error)?
            .claims;

        if claims.typ != expected {
            return Err(TokenError::Invalid);
        }
        parse_subject(&claims.sub)
    }

    /// Fully verify a refresh token: signature and expiry, ledger state,
    /// then the owning account's status.
    ///
    /// # Errors
    ///
    /// Returns `Token(Invalid)` for unknown tokens or inactive owners,
    /// `Token(Revoked)` for revoked ones, `Token(Expired)` past expiry.
    pub fn verify_refresh(
        &self,
        token: &str,
        ledger: &TokenLedger,
        users: &UserStore,
    ) -> Result<User, AuthError> {
        let user_id = self.decode_session(token, TokenType::Refresh)?;

        let record = ledger.find(token)?.ok_or(TokenError::Invalid)?;
        if record.kind != TokenKind::Refresh || record.user_id != user_id {
            return Err(TokenError::Invalid.into());
        }
        if record.revoked {
            return Err(TokenError::Revoked.into());
        }
        if record.expires_at <= Utc::now() {
            return Err(TokenError::Expired.into());
        }

        match users.get(user_id)? {
            Some(user) if user.is_active() => Ok(user),
            _ => Err(TokenError::Invalid.into()),
        }
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_ttl", &self.access_ttl)
            .field("reset_ttl", &self.reset_ttl)
            .finish_non_exhaustive()
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> TokenError {
    match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    }
}

fn parse_subject(sub: &str) -> Result<UserId, TokenError> {
    sub.parse().map_err(|_| TokenError::Invalid)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

fn random_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn load_or_create_secret(path: &Path) -> Result<String, AuthError> {
    match std::fs::read_to_string(path) {
        Ok(secret) => Ok(secret.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AuthError::Config(format!("Cannot create state dir: {e}")))?;
            }
            let secret = TokenIssuer::generate_hex_secret();
            std::fs::write(path, &secret)
                .map_err(|e| AuthError::Config(format!("Cannot write JWT secret: {e}")))?;
            restrict_permissions(path);
            tracing::info!(path = %path.display(), "Generated new JWT secret");
            Ok(secret)
        }
        Err(e) => Err(AuthError::Config(format!("Cannot read JWT secret: {e}"))),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(error = %e, "Could not restrict JWT secret permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::users::tests::{new_user, open_store};
    use tempfile::TempDir;

    fn issuer_with_ttl(access: Duration) -> TokenIssuer {
        TokenIssuer::new(
            &TokenIssuer::generate_secret(),
            access,
            Duration::from_secs(3600),
        )
    }

    fn issuer() -> TokenIssuer {
        issuer_with_ttl(Duration::from_secs(3600))
    }

    #[test]
    fn test_generate_secret() {
        let secret1 = TokenIssuer::generate_secret();
        let secret2 = TokenIssuer::generate_secret();
        assert_ne!(secret1, secret2);
        assert_eq!(TokenIssuer::generate_hex_secret().len(), 64);
    }

    #[test]
    fn test_access_round_trip() {
        let (_dir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();
        let issuer = issuer();

        let pair = issuer.mint(&user).unwrap();
        let identity = issuer.verify_access(&pair.access_token).unwrap();
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.role, Role::Employee);
        assert_eq!(identity.department, Department::None);
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn test_pairs_are_unique() {
        let (_dir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();
        let issuer = issuer();

        let a = issuer.mint(&user).unwrap();
        let b = issuer.mint(&user).unwrap();
        assert_ne!(a.access_token, b.access_token);
        assert_ne!(a.refresh_token, b.refresh_token);
    }

    #[test]
    fn test_expired_access_token() {
        let (_dir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();
        let issuer = issuer_with_ttl(Duration::from_secs(1));

        let pair = issuer.mint(&user).unwrap();
        std::thread::sleep(Duration::from_secs(2));
        assert_eq!(
            issuer.verify_access(&pair.access_token),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_wrong_type_rejected() {
        let (_dir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();
        let issuer = issuer();
        let pair = issuer.mint(&user).unwrap();

        assert_eq!(
            issuer.verify_access(&pair.refresh_token),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            issuer.decode_session(&pair.access_token, TokenType::Refresh),
            Err(TokenError::Invalid)
        );
        let (reset, _) = issuer.mint_reset(user.id).unwrap();
        assert_eq!(
            issuer.decode_session(&reset, TokenType::Refresh),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            issuer.decode_session(&reset, TokenType::ResetPassword),
            Ok(user.id)
        );
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let (_dir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();
        let pair = issuer().mint(&user).unwrap();

        assert_eq!(
            issuer().verify_access(&pair.access_token),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            issuer().verify_access("invalid.token.here"),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_verify_refresh_states() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let users = UserStore::new(&db).unwrap();
        let ledger = TokenLedger::new(&db).unwrap();
        let issuer = issuer();

        let user = users.create(new_user("alice")).unwrap();
        let pair = issuer.mint(&user).unwrap();

        // Not yet persisted.
        assert!(matches!(
            issuer.verify_refresh(&pair.refresh_token, &ledger, &users),
            Err(AuthError::Token(TokenError::Invalid))
        ));

        ledger
            .persist(user.id, &pair.refresh_token, TokenKind::Refresh, pair.refresh_expires_at)
            .unwrap();
        assert_eq!(
            issuer
                .verify_refresh(&pair.refresh_token, &ledger, &users)
                .unwrap()
                .id,
            user.id
        );

        users
            .transition(user.id, crate::auth::AccountStatus::Suspended)
            .unwrap();
        assert!(issuer
            .verify_refresh(&pair.refresh_token, &ledger, &users)
            .is_err());

        users
            .transition(user.id, crate::auth::AccountStatus::Active)
            .unwrap();
        ledger.revoke(&pair.refresh_token).unwrap();
        assert!(matches!(
            issuer.verify_refresh(&pair.refresh_token, &ledger, &users),
            Err(AuthError::Token(TokenError::Revoked))
        ));
    }

    #[test]
    fn test_secret_file_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("jwt-secret");
        let config = AuthConfig::default();

        let (_udir, store) = open_store();
        let user = store.create(new_user("alice")).unwrap();

        let first = TokenIssuer::from_config(&config, &path).unwrap();
        assert!(path.exists());
        let second = TokenIssuer::from_config(&config, &path).unwrap();

        let pair = first.mint(&user).unwrap();
        assert!(second.verify_access(&pair.access_token).is_ok());
    }

    #[test]
    fn test_short_hex_secret_rejected() {
        assert!(matches!(
            TokenIssuer::from_hex_secret("abcd", Duration::from_secs(1), Duration::from_secs(1)),
            Err(AuthError::Config(_))
        ));
        assert!(matches!(
            TokenIssuer::from_hex_secret("zz", Duration::from_secs(1), Duration::from_secs(1)),
            Err(AuthError::Config(_))
        ));
    }
}
