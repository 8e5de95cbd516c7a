//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, USER_AGENT},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{jwt::JwtManager, sessions};

/// HttpOnly cookie carrying the session JWT
pub const SESSION_COOKIE: &str = "boilerkit_session";

/// Authenticated user information extracted from the session token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub is_admin: bool,
    /// JWT id of the session that authenticated this request
    pub session_jti: String,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

#[derive(Debug, FromRow)]
struct AccountStatusRow {
    email: String,
    role: String,
    is_admin: bool,
    banned: bool,
    ban_reason: Option<String>,
    ban_expires: Option<OffsetDateTime>,
}

/// Extract the session token from the `boilerkit_session` cookie
pub(crate) fn extract_token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .filter(|token| !token.is_empty())
                .map(String::from)
        })
}

/// Extract bearer token from Authorization header or HttpOnly cookie
///
/// The header wins when both are present.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    extract_token_from_cookie(headers)
}

/// Extract IP address from request headers (X-Forwarded-For, CF-Connecting-IP or X-Real-IP)
pub fn extract_ip_address(headers: &HeaderMap) -> Option<String> {
    // First hop of X-Forwarded-For is the client
    if let Some(xff) = headers.get("X-Forwarded-For") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(ip) = xff_str.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
                return Some(ip.to_string());
            }
        }
    }
    if let Some(cf_ip) = headers.get("CF-Connecting-IP") {
        if let Ok(ip) = cf_ip.to_str() {
            return Some(ip.to_string());
        }
    }
    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(ip) = real_ip.to_str() {
            return Some(ip.to_string());
        }
    }
    None
}

pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// A ban with no expiry is permanent
pub fn ban_is_active(banned: bool, ban_expires: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    match (banned, ban_expires) {
        (false, _) => false,
        (true, None) => true,
        (true, Some(expires)) => expires > now,
    }
}

/// `Set-Cookie` value for a new session
pub fn session_cookie(token: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={max_age_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the session cookie
pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(request.headers()) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token).await {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_token(token)
        .map_err(|_| AuthError::InvalidToken)?;

    let session_valid = sessions::is_session_valid(&auth_state.pool, &claims.jti, claims.sub)
        .await
        .map_err(|_| AuthError::DatabaseError)?;
    if !session_valid {
        tracing::warn!(jti = %claims.jti, user_id = %claims.sub, "Session revoked or expired");
        return Err(AuthError::SessionRevoked);
    }

    // Role and ban state come from the row, not the token, so changes apply immediately
    let account: Option<AccountStatusRow> = sqlx::query_as(
        "SELECT email, role, is_admin, banned, ban_reason, ban_expires FROM users WHERE id = $1",
    )
    .bind(claims.sub)
    .fetch_optional(&auth_state.pool)
    .await
    .map_err(|_| AuthError::DatabaseError)?;

    let Some(account) = account else {
        tracing::warn!(user_id = %claims.sub, "Token for a deleted user");
        return Err(AuthError::InvalidToken);
    };

    if ban_is_active(account.banned, account.ban_expires, OffsetDateTime::now_utc()) {
        return Err(AuthError::Banned(account.ban_reason));
    }

    Ok(AuthUser {
        user_id: claims.sub,
        email: account.email,
        role: account.role,
        is_admin: account.is_admin,
        session_jti: claims.jti,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Session revoked or expired")]
    SessionRevoked,
    #[error("Account banned")]
    Banned(Option<String>),
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Database error")]
    DatabaseError,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required".to_string()),
            AuthError::InvalidToken | AuthError::SessionRevoked => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token".to_string())
            }
            AuthError::Banned(Some(reason)) => {
                (StatusCode::FORBIDDEN, format!("Account banned: {reason}"))
            }
            AuthError::Banned(None) => (StatusCode::FORBIDDEN, "Account banned".to_string()),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions".to_string())
            }
            AuthError::DatabaseError | AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "success": false,
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
