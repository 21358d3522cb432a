//! Client-facing error envelope shared by the gateway and the auth service.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use portico_core::FieldErrors;
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

/// Message for a missing or malformed `Authorization` header.
pub const MISSING_TOKEN: &str = "Missing or invalid token format";
/// Message for a token that failed verification.
pub const INVALID_TOKEN: &str = "Invalid or expired token";
/// Message for a failed capability check.
pub const INSUFFICIENT_PERMISSIONS: &str = "Insufficient permissions";

/// Convenience alias for handler return types.
pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP-level errors with status mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Authentication failed. 401.
    #[error("Unauthorized - {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed. 403.
    #[error("Forbidden - {0}")]
    Forbidden(String),

    /// Unique key taken or invalid state change. 409.
    #[error("{0}")]
    Conflict(String),

    /// Backend could not be reached. 502.
    #[error("{service} service is unavailable")]
    BadGateway {
        /// Name of the unreachable service.
        service: String,
    },

    /// Field validation failed. 400.
    #[error("Validation failed")]
    Validation(FieldErrors),

    /// Malformed request body. 400.
    #[error("{0}")]
    BadRequest(String),

    /// No such resource or route. 404.
    #[error("{0}")]
    NotFound(String),

    /// Throttled. 429.
    #[error("Too many requests")]
    RateLimited,

    /// Anything else. 500; detail is only logged.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// 401 for a missing or malformed bearer header.
    #[must_use]
    pub fn missing_token() -> Self {
        Self::Unauthorized(MISSING_TOKEN.to_string())
    }

    /// 401 for a token that failed verification.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::Unauthorized(INVALID_TOKEN.to_string())
    }

    /// 403 for a failed capability check.
    #[must_use]
    pub fn forbidden() -> Self {
        Self::Forbidden(INSUFFICIENT_PERMISSIONS.to_string())
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::BadGateway { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<FieldErrors>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = match self {
            Self::Unauthorized(_) | Self::Forbidden(_) | Self::Conflict(_) => ErrorBody {
                error: self.to_string(),
                code,
                message: None,
                details: None,
            },
            Self::BadGateway { .. } => ErrorBody {
                error: "Bad Gateway".to_string(),
                code,
                message: Some(self.to_string()),
                details: None,
            },
            Self::Validation(details) => ErrorBody {
                error: "Validation failed".to_string(),
                code,
                message: None,
                details: Some(details),
            },
            Self::BadRequest(message) => ErrorBody {
                error: "Bad Request".to_string(),
                code,
                message: Some(message),
                details: None,
            },
            Self::NotFound(message) => ErrorBody {
                error: "Not Found".to_string(),
                code,
                message: Some(message),
                details: None,
            },
            Self::RateLimited => ErrorBody {
                error: "Too Many Requests".to_string(),
                code,
                message: None,
                details: None,
            },
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                ErrorBody {
                    error: "Internal Server Error".to_string(),
                    code,
                    message: None,
                    details: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => Self::Unauthorized("Invalid credentials".to_string()),
            AuthError::AccountInactive(status) => {
                Self::Unauthorized(format!("Account is {status}"))
            }
            AuthError::Token(_) | AuthError::AlreadyRotated => Self::invalid_token(),
            AuthError::UserNotFound(_) => Self::NotFound("User not found".to_string()),
            AuthError::Conflict(msg) => Self::Conflict(msg),
            AuthError::InvalidTransition { .. } => Self::Conflict(e.to_string()),
            AuthError::PermissionDenied(msg) => Self::Forbidden(msg),
            AuthError::Validation(details) => Self::Validation(details),
            AuthError::Storage(msg) | AuthError::Config(msg) => Self::Internal(msg),
        }
    }
}

impl From<FieldErrors> for ApiError {
    fn from(details: FieldErrors) -> Self {
        Self::Validation(details)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenError;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_unauthorized_envelope() {
        let (status, body) = body_json(ApiError::missing_token()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body["error"],
            "Unauthorized - Missing or invalid token format"
        );
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_bad_gateway_envelope() {
        let (status, body) = body_json(ApiError::BadGateway {
            service: "tickets".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Bad Gateway");
        assert_eq!(body["code"], "UPSTREAM_UNAVAILABLE");
        assert_eq!(body["message"], "tickets service is unavailable");
    }

    #[tokio::test]
    async fn test_internal_hides_detail() {
        let (status, body) = body_json(ApiError::Internal("disk on fire".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("disk"));
    }

    #[tokio::test]
    async fn test_validation_details() {
        let mut details = FieldErrors::new();
        details.add("email", "Invalid email format");
        let (status, body) = body_json(ApiError::Validation(details)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"]["email"][0], "Invalid email format");
    }

    #[test]
    fn test_auth_error_mapping() {
        assert_eq!(
            ApiError::from(AuthError::Token(TokenError::Revoked)).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::AlreadyRotated).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::Conflict("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(AuthError::Storage("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
