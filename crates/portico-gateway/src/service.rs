//! Auth service HTTP API, mounted at `/api/auth`.

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Request, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use portico_core::{Department, Permission, Requirement, Role, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use validator::Validate;

use crate::auth::{
    AccountStatus, AuthError, AuthState, NewUser, ProfileUpdate, PublicUser, RequireAuth,
    TokenKind, TokenPair, TokenType, User,
};
use crate::error::{ApiError, ApiResult};

/// JSON body extractor that reports problems in the error envelope and
/// runs field validation.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    #[validate(length(min = 3, max = 50, message = "Username must be between 3 and 50 characters"))]
    username: String,
    #[validate(email(message = "Invalid email format"))]
    email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    password: String,
    #[validate(length(min = 1, max = 100, message = "First name is required"))]
    first_name: String,
    #[validate(length(min = 1, max = 100, message = "Last name is required"))]
    last_name: String,
    #[validate(length(max = 100))]
    job_title: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    username: Option<String>,
    email: Option<String>,
    #[validate(length(min = 1, message = "Password is required"))]
    password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ForgotPasswordRequest {
    email: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    token: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 100))]
    first_name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    last_name: Option<String>,
    #[validate(length(max = 100))]
    job_title: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    current_password: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
struct RoleRequest {
    role: Role,
}

#[derive(Debug, Deserialize, Validate)]
struct DepartmentRequest {
    department: Department,
}

#[derive(Debug, Deserialize, Validate)]
struct StatusRequest {
    status: AccountStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    user: PublicUser,
    #[serde(flatten)]
    tokens: TokenPair,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    user: PublicUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForgotPasswordResponse {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_token: Option<String>,
}

/// Run blocking storage or hashing work off the async runtime.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("Blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

/// Mint a pair and record its refresh token.
fn open_session(state: &AuthState, user: &User) -> Result<TokenPair, AuthError> {
    let pair = state.issuer.mint(user)?;
    state.ledger.persist(
        user.id,
        &pair.refresh_token,
        TokenKind::Refresh,
        pair.refresh_expires_at,
    )?;
    Ok(pair)
}

async fn register(
    State(state): State<AuthState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let response = blocking(move || {
        let user = state.users.create(NewUser {
            username: req.username,
            email: req.email,
            password: req.password,
            first_name: req.first_name,
            last_name: req.last_name,
            job_title: req.job_title,
            role: Role::Employee,
            department: Department::None,
        })?;
        let tokens = open_session(&state, &user)?;
        Ok(SessionResponse {
            user: user.to_public(),
            tokens,
        })
    })
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(state): State<AuthState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let Some(identifier) = req
        .username
        .or(req.email)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        let mut details = portico_core::FieldErrors::new();
        details.add("username", "Username or email is required");
        return Err(details.into());
    };

    if !state.login_limiter.check(&identifier) {
        tracing::warn!(identifier = %identifier, "Login throttled");
        return Err(ApiError::RateLimited);
    }

    let password = req.password;
    let response = blocking(move || {
        let user = state
            .users
            .authenticate(&identifier, &password)
            .inspect_err(|e| tracing::info!(identifier = %identifier, reason = %e, "Login failed"))?;
        let tokens = open_session(&state, &user)?;
        tracing::info!(user_id = %user.id, "Login succeeded");
        Ok(SessionResponse {
            user: user.to_public(),
            tokens,
        })
    })
    .await?;

    Ok(Json(response))
}

async fn refresh_token(
    State(state): State<AuthState>,
    ApiJson(req): ApiJson<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let pair = blocking(move || {
        let user = state
            .issuer
            .verify_refresh(&req.refresh_token, &state.ledger, &state.users)?;
        let pair = state.issuer.mint(&user)?;
        state.ledger.rotate(
            user.id,
            &req.refresh_token,
            &pair.refresh_token,
            pair.refresh_expires_at,
        )?;
        tracing::debug!(user_id = %user.id, "Refresh token rotated");
        Ok(pair)
    })
    .await
    .inspect_err(|e| tracing::info!(reason = %e, "Refresh rejected"))?;

    Ok(Json(pair))
}

async fn logout(
    State(state): State<AuthState>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Json<Value> {
    if let Ok(Json(req)) = body {
        if let Err(e) = blocking(move || state.ledger.revoke(&req.refresh_token)).await {
            tracing::warn!(error = %e, "Logout revoke failed");
        }
    }
    Json(json!({ "message": "Logged out successfully" }))
}

async fn forgot_password(
    State(state): State<AuthState>,
    ApiJson(req): ApiJson<ForgotPasswordRequest>,
) -> ApiResult<Json<ForgotPasswordResponse>> {
    let expose = state.config.expose_reset_tokens;
    let token = blocking(move || {
        let Some(user) = state.users.get_by_email(&req.email)? else {
            return Ok(None);
        };
        if !user.is_active() {
            return Ok(None);
        }
        let (token, expires_at) = state.issuer.mint_reset(user.id)?;
        state
            .ledger
            .persist(user.id, &token, TokenKind::ResetPassword, expires_at)?;
        tracing::info!(user_id = %user.id, "Password reset token issued");
        Ok(Some(token))
    })
    .await?;

    Ok(Json(ForgotPasswordResponse {
        message: "If the account exists, password reset instructions have been sent",
        reset_token: token.filter(|_| expose),
    }))
}

async fn reset_password(
    State(state): State<AuthState>,
    ApiJson(req): ApiJson<ResetPasswordRequest>,
) -> ApiResult<Json<Value>> {
    // The reset token is single-use, so reject the password before spending it.
    let problems = portico_core::validation::password_problems(&req.new_password);
    if !problems.is_empty() {
        let mut details = portico_core::FieldErrors::new();
        for problem in problems {
            details.add("newPassword", problem);
        }
        return Err(details.into());
    }

    blocking(move || {
        let user_id = state
            .issuer
            .decode_session(&req.token, TokenType::ResetPassword)?;
        let record = state.ledger.consume(&req.token, TokenKind::ResetPassword)?;
        if record.user_id != user_id {
            return Err(crate::auth::TokenError::Invalid.into());
        }
        state.users.set_password(user_id, &req.new_password)?;
        state.ledger.revoke_all(user_id, TokenKind::Refresh)?;
        tracing::info!(user_id = %user_id, "Password reset");
        Ok(())
    })
    .await?;

    Ok(Json(json!({ "message": "Password has been reset" })))
}

fn current_user(state: &AuthState, id: UserId) -> Result<User, AuthError> {
    let user = state
        .users
        .get(id)?
        .ok_or_else(|| AuthError::UserNotFound(id.to_string()))?;
    if user.is_active() {
        Ok(user)
    } else {
        Err(AuthError::AccountInactive(user.status))
    }
}

async fn me(State(state): State<AuthState>, auth: RequireAuth) -> ApiResult<Json<UserResponse>> {
    let id = auth.identity().user_id;
    let user = blocking(move || current_user(&state, id)).await?;
    Ok(Json(UserResponse {
        user: user.to_public(),
    }))
}

async fn update_me(
    State(state): State<AuthState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> ApiResult<Json<UserResponse>> {
    let id = auth.identity().user_id;
    let user = blocking(move || {
        current_user(&state, id)?;
        state.users.update_profile(
            id,
            &ProfileUpdate {
                first_name: req.first_name,
                last_name: req.last_name,
                job_title: req.job_title,
            },
        )
    })
    .await?;
    Ok(Json(UserResponse {
        user: user.to_public(),
    }))
}

async fn change_password(
    State(state): State<AuthState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<ChangePasswordRequest>,
) -> ApiResult<Json<Value>> {
    let id = auth.identity().user_id;
    blocking(move || {
        current_user(&state, id)?;
        state
            .users
            .change_password(id, &req.current_password, &req.new_password)?;
        state.ledger.revoke_all(id, TokenKind::Refresh)?;
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "message": "Password changed successfully" })))
}

async fn logout_all(State(state): State<AuthState>, auth: RequireAuth) -> ApiResult<Json<Value>> {
    let id = auth.identity().user_id;
    let revoked = blocking(move || state.ledger.revoke_all(id, TokenKind::Refresh)).await?;
    Ok(Json(json!({
        "message": "Logged out from all sessions",
        "revoked": revoked,
    })))
}

async fn list_users(State(state): State<AuthState>, auth: RequireAuth) -> ApiResult<Json<Value>> {
    auth.require(Requirement::Permission(Permission::ManageUsers))?;
    let users = blocking(move || state.users.list(false)).await?;
    let users: Vec<PublicUser> = users.iter().map(User::to_public).collect();
    Ok(Json(json!({ "users": users })))
}

/// Only a director may act on a director's account.
fn guard_target(caller: &RequireAuth, target: &User) -> Result<(), AuthError> {
    if target.role.is_director() && !caller.identity().role.is_director() {
        return Err(AuthError::PermissionDenied(
            crate::error::INSUFFICIENT_PERMISSIONS.to_string(),
        ));
    }
    Ok(())
}

fn load_target(state: &AuthState, id: UserId) -> Result<User, AuthError> {
    state
        .users
        .get(id)?
        .ok_or_else(|| AuthError::UserNotFound(id.to_string()))
}

async fn set_role(
    State(state): State<AuthState>,
    auth: RequireAuth,
    Path(id): Path<u64>,
    ApiJson(req): ApiJson<RoleRequest>,
) -> ApiResult<Json<UserResponse>> {
    let id = UserId(id);
    auth.require(Requirement::Permission(Permission::ManageUsers))?;
    if req.role.is_director() {
        auth.require(Requirement::Role(Role::Director))?;
    }
    let user = blocking(move || {
        guard_target(&auth, &load_target(&state, id)?)?;
        let user = state.users.set_role(id, req.role)?;
        tracing::info!(user_id = %id, role = %req.role, by = %auth.identity().user_id, "Role changed");
        Ok(user)
    })
    .await?;
    Ok(Json(UserResponse {
        user: user.to_public(),
    }))
}

async fn set_department(
    State(state): State<AuthState>,
    auth: RequireAuth,
    Path(id): Path<u64>,
    ApiJson(req): ApiJson<DepartmentRequest>,
) -> ApiResult<Json<UserResponse>> {
    let id = UserId(id);
    auth.require(Requirement::Permission(Permission::ManageUsers))?;
    let user = blocking(move || {
        guard_target(&auth, &load_target(&state, id)?)?;
        state.users.set_department(id, req.department)
    })
    .await?;
    Ok(Json(UserResponse {
        user: user.to_public(),
    }))
}

async fn set_status(
    State(state): State<AuthState>,
    auth: RequireAuth,
    Path(id): Path<u64>,
    ApiJson(req): ApiJson<StatusRequest>,
) -> ApiResult<Json<UserResponse>> {
    let id = UserId(id);
    auth.require(Requirement::Permission(Permission::ManageUsers))?;
    if req.status == AccountStatus::Deleted {
        let mut details = portico_core::FieldErrors::new();
        details.add("status", "Use DELETE to remove an account");
        return Err(details.into());
    }
    let user = blocking(move || {
        guard_target(&auth, &load_target(&state, id)?)?;
        let user = state.users.transition(id, req.status)?;
        if req.status == AccountStatus::Suspended {
            state.ledger.revoke_all(id, TokenKind::Refresh)?;
        }
        Ok(user)
    })
    .await?;
    Ok(Json(UserResponse {
        user: user.to_public(),
    }))
}

async fn delete_user(
    State(state): State<AuthState>,
    auth: RequireAuth,
    Path(id): Path<u64>,
) -> ApiResult<Json<Value>> {
    let id = UserId(id);
    auth.require(Requirement::Permission(Permission::ManageUsers))?;
    blocking(move || {
        guard_target(&auth, &load_target(&state, id)?)?;
        state.users.transition(id, AccountStatus::Deleted)?;
        state.ledger.revoke_all(id, TokenKind::Refresh)?;
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "message": "User deleted" })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "auth" }))
}

/// Build the auth service router.
pub fn router(state: AuthState) -> Router {
    let api = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh-token", post(refresh_token))
        .route("/logout", post(logout))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password", post(reset_password))
        .route("/me", get(me).put(update_me))
        .route("/change-password", put(change_password))
        .route("/logout-all", post(logout_all))
        .route("/users", get(list_users))
        .route("/users/{id}/role", put(set_role))
        .route("/users/{id}/department", put(set_department))
        .route("/users/{id}/status", put(set_status))
        .route("/users/{id}", delete(delete_user));

    let cors = state.config.cors;
    let timeout = state.config.request_timeout();

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api/auth", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state);

    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{TokenIssuer, open_database};
    use axum::body::{Body, to_bytes};
    use portico_core::AuthConfig;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let db = open_database(dir.path()).unwrap();
        let issuer = TokenIssuer::new(
            &TokenIssuer::generate_secret(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let state = AuthState::new(AuthConfig::default(), issuer, &db).unwrap();
        (dir, router(state))
    }

    async fn call(app: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let (status, body) = call(app, "GET", "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "auth");
    }

    #[tokio::test]
    async fn test_register_then_me() {
        let (_dir, app) = app();
        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/auth/register",
            json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "secret1",
                "firstName": "Alice",
                "lastName": "Liddell",
                "department": "laboratorio",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["role"], "employee");
        assert_eq!(body["user"]["department"], "none");

        let token = body["accessToken"].as_str().unwrap();
        let request = axum::http::Request::builder()
            .uri("/api/auth/me")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_duplicate_conflicts() {
        let (_dir, app) = app();
        let body = json!({
            "username": "bob",
            "email": "bob@example.com",
            "password": "secret1",
            "firstName": "Bob",
            "lastName": "Builder",
        });
        let (status, _) = call(app.clone(), "POST", "/api/auth/register", body.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = call(app, "POST", "/api/auth/register", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_login_requires_identifier() {
        let (_dir, app) = app();
        let (status, body) =
            call(app, "POST", "/api/auth/login", json!({ "password": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"]["username"].is_array());
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (_dir, app) = app();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_always_ok() {
        let (_dir, app) = app();
        let (status, _) = call(
            app,
            "POST",
            "/api/auth/logout",
            json!({ "refreshToken": "never-issued" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_users_requires_bearer() {
        let (_dir, app) = app();
        let request = axum::http::Request::builder()
            .uri("/api/auth/users")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_register_request_validation() {
        let req: RegisterRequest = serde_json::from_value(json!({
            "username": "al",
            "email": "nope",
            "password": "123",
            "firstName": "",
            "lastName": "Smith",
        }))
        .unwrap();
        let errors = portico_core::FieldErrors::from(req.validate().unwrap_err());
        assert!(errors.get("username").is_some());
        assert!(errors.get("email").is_some());
        assert!(errors.get("password").is_some());
        assert!(errors.get("firstName").is_some());
        assert!(errors.get("lastName").is_none());
    }

    #[test]
    fn test_session_response_shape() {
        let now = chrono::Utc::now();
        let response = SessionResponse {
            user: PublicUser {
                id: UserId(1),
                username: "alice".into(),
                email: "alice@x.com".into(),
                first_name: "A".into(),
                last_name: "L".into(),
                job_title: None,
                role: Role::Employee,
                department: Department::None,
                status: AccountStatus::Active,
                last_login: None,
                created_at: now,
                updated_at: now,
            },
            tokens: TokenPair {
                access_token: "a".into(),
                refresh_token: "r".into(),
                expires_at: now,
                refresh_expires_at: now,
                token_type: "Bearer".into(),
            },
        };
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["accessToken"], "a");
        assert_eq!(value["refreshToken"], "r");
        assert_eq!(value["user"]["username"], "alice");
        assert!(value["user"].get("passwordHash").is_none());
    }
}
