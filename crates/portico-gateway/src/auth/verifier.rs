//! Bearer-token verification for incoming requests.
//!
//! Read-only: verification never touches storage and never refreshes.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};

use super::jwt::{Identity, TokenIssuer};
use super::policy::{self, Decision};
use crate::error::ApiError;
use portico_core::Requirement;

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// The scheme is case-insensitive; the token must be non-empty.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() && !token.contains(' '))
        .then_some(token)
}

/// Authenticate a request from its headers.
///
/// # Errors
///
/// Returns `Unauthorized` for a missing/malformed header or a token that
/// fails verification.
pub fn authenticate(issuer: &TokenIssuer, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let Some(token) = bearer_token(headers) else {
        tracing::debug!("Rejected request without bearer token");
        return Err(ApiError::missing_token());
    };

    match issuer.verify_access(token) {
        Ok(identity) => {
            tracing::debug!(user_id = %identity.user_id, role = %identity.role, "Authenticated");
            Ok(identity)
        }
        Err(e) => {
            tracing::info!(reason = %e, "Rejected bearer token");
            Err(ApiError::invalid_token())
        }
    }
}

/// Check a requirement against an identity.
///
/// # Errors
///
/// Returns `Forbidden` when the policy denies access.
pub fn authorize(identity: &Identity, requirement: Requirement) -> Result<(), ApiError> {
    match policy::check(identity, requirement) {
        Decision::Allow => Ok(()),
        Decision::Deny => {
            tracing::info!(
                user_id = %identity.user_id,
                requirement = %requirement,
                "Authorization denied"
            );
            Err(ApiError::forbidden())
        }
    }
}

/// Extractor for authenticated requests.
///
/// Use this in handler parameters to require authentication.
#[derive(Debug, Clone)]
pub struct RequireAuth(pub Identity);

impl RequireAuth {
    /// The verified identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.0
    }

    /// Require a capability of the caller.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when the policy denies access.
    pub fn require(&self, requirement: Requirement) -> Result<(), ApiError> {
        authorize(&self.0, requirement)
    }
}

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
    Arc<TokenIssuer>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return Ok(Self(identity.clone()));
        }

        let issuer = Arc::<TokenIssuer>::from_ref(state);
        let identity = authenticate(&issuer, &parts.headers)?;
        parts.extensions.insert(identity.clone());
        Ok(Self(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use portico_core::{Department, Permission, Role, UserId};
    use std::time::Duration;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("BEARER abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("abc123")), None);
        assert_eq!(bearer_token(&headers("Basic abc123")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&headers("Bearer a b")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_authenticate_states() {
        let issuer = TokenIssuer::new(
            &TokenIssuer::generate_secret(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        let err = authenticate(&issuer, &HeaderMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unauthorized - Missing or invalid token format"
        );

        let err = authenticate(&issuer, &headers("Bearer not.a.jwt")).unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized - Invalid or expired token");
    }

    #[test]
    fn test_authorize() {
        let identity = Identity {
            user_id: UserId(3),
            username: "eve".to_string(),
            role: Role::Employee,
            department: Department::Informatica,
        };
        assert!(authorize(&identity, Requirement::Department(Department::Informatica)).is_ok());
        let err = authorize(&identity, Requirement::Permission(Permission::ViewReports))
            .unwrap_err();
        assert_eq!(err.to_string(), "Forbidden - Insufficient permissions");
    }
}
