//! Email/password authentication routes
//!
//! Sign-up and sign-in issue a session JWT, returned in the body and as the
//! `boilerkit_session` cookie. Emailed tokens drive verification, password
//! reset and account deletion.

use axum::{
    extract::{Extension, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use boilerkit_billing::{BillingError, BillingService};
use boilerkit_shared::EmailMessage;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::{
    activity::{log_activity, ActivityAction},
    auth::{
        ban_is_active, clear_session_cookie, extract_ip_address, extract_user_agent,
        generate_impossible_hash, hash_password, session_cookie, sessions, tokens,
        validate_password_strength, verify_password, AuthUser, TokenPurpose,
    },
    error::{ApiError, ApiResult},
    state::AppState,
    users::{self, NewUser, UserRecord, UserView},
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgetPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
    #[serde(default, rename = "callbackURL")]
    pub callback_url: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve a client supplied redirect against the frontend origin
///
/// Relative paths are joined to `app_url`; absolute URLs must share its
/// scheme, host and port. Anything else is dropped.
pub fn safe_callback(app_url: &str, callback: Option<&str>) -> Option<String> {
    let callback = callback?.trim();
    if callback.is_empty() {
        return None;
    }

    let base = Url::parse(app_url).ok()?;
    let target = if callback.starts_with('/') && !callback.starts_with("//") {
        base.join(callback).ok()?
    } else {
        Url::parse(callback).ok()?
    };

    (target.origin() == base.origin()).then(|| target.to_string())
}

async fn hash_off_thread(password: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("Password hashing task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("Failed to hash password: {e}")))
}

/// Unknown accounts are checked against a random hash so timing matches
async fn verify_off_thread(password: String, hash: Option<String>) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || match hash {
        Some(hash) => Ok(verify_password(&password, &hash)),
        None => generate_impossible_hash().map(|hash| verify_password(&password, &hash)),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Password verification task failed: {e}")))?
    .map_err(|e| ApiError::Internal(format!("Failed to hash password: {e}")))
}

fn send_in_background(state: &AppState, message: EmailMessage) {
    let emails = state.auth_emails.clone();
    tokio::spawn(async move { emails.send(message).await });
}

/// Sign a JWT, persist its session row and build the response
async fn session_response(state: &AppState, headers: &HeaderMap, user: &UserRecord) -> ApiResult<Response> {
    let issued = state
        .jwt_manager
        .generate_token(user.id, &user.email, &user.role)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let ip_address = extract_ip_address(headers);
    let user_agent = extract_user_agent(headers);
    sessions::save_session(
        &state.pool,
        user.id,
        &issued.jti,
        issued.expires_at,
        ip_address.as_deref(),
        user_agent.as_deref(),
    )
    .await?;

    let cookie = session_cookie(
        &issued.token,
        state.jwt_manager.expiry().whole_seconds(),
        state.config.cookie_secure,
    );
    let body = json!({
        "success": true,
        "data": {
            "token": issued.token,
            "user": UserView::from_record(user, OffsetDateTime::now_utc()),
        }
    });

    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

fn done_or_redirect(state: &AppState, callback: Option<&str>, message: &str) -> Response {
    match safe_callback(&state.config.app_url, callback) {
        Some(target) => Redirect::to(&target).into_response(),
        None => Json(json!({ "success": true, "message": message })).into_response(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/auth/sign-up/email
pub async fn sign_up(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SignUpRequest>,
) -> ApiResult<Response> {
    let name = users::validate_name(&req.name)?;
    let email = users::normalize_email(&req.email)?;
    validate_password_strength(&req.password).map_err(ApiError::Validation)?;

    if users::find_by_email(&state.pool, &email).await?.is_some() {
        return Err(ApiError::Conflict(
            "An account with this email already exists".to_string(),
        ));
    }

    let password_hash = hash_off_thread(req.password).await?;
    let mut user = users::create_with_password(
        &state.pool,
        NewUser {
            name: &name,
            firstname: req.firstname.as_deref(),
            lastname: req.lastname.as_deref(),
            email: &email,
            image: req.image.as_deref(),
            password_hash: &password_hash,
        },
    )
    .await?;

    tracing::info!(user_id = %user.id, "User signed up");

    if state.config.signup_trial_days > 0 {
        if let Some(billing) = &state.billing {
            let now = OffsetDateTime::now_utc();
            match billing
                .subscriptions
                .start_trial(user.id, state.config.signup_trial_days, now)
                .await
            {
                Ok(snapshot) => {
                    user.is_trial_active = snapshot.is_trial_active;
                    user.trial_start_date = snapshot.trial_start_date;
                    user.trial_end_date = snapshot.trial_end_date;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "Failed to start sign-up trial");
                }
            }
        }
    }

    let token = tokens::issue(&state.pool, TokenPurpose::EmailVerification, user.id).await?;
    send_in_background(
        &state,
        state.auth_emails.verification(&user.email, &user.name, &token),
    );

    log_activity(
        state.pool.clone(),
        user.id,
        ActivityAction::SignUp,
        extract_ip_address(&headers),
    );

    session_response(&state, &headers, &user).await
}

/// POST /api/auth/sign-in/email
pub async fn sign_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SignInRequest>,
) -> ApiResult<Response> {
    let email = users::normalize_email(&req.email).map_err(|_| ApiError::InvalidCredentials)?;

    let user = users::find_by_email(&state.pool, &email).await?;
    let hash = match &user {
        Some(user) => users::credential_hash(&state.pool, user.id).await?,
        None => None,
    };

    let password_ok = verify_off_thread(req.password, hash).await?;
    let user = match user {
        Some(user) if password_ok => user,
        _ => {
            tracing::debug!("Sign-in rejected");
            return Err(ApiError::InvalidCredentials);
        }
    };

    if ban_is_active(user.banned, user.ban_expires, OffsetDateTime::now_utc()) {
        tracing::warn!(user_id = %user.id, "Sign-in attempt by banned user");
        return Err(ApiError::Forbidden);
    }

    log_activity(
        state.pool.clone(),
        user.id,
        ActivityAction::SignIn,
        extract_ip_address(&headers),
    );
    tracing::info!(user_id = %user.id, "User signed in");

    session_response(&state, &headers, &user).await
}

/// POST /api/auth/sign-out
pub async fn sign_out(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    sessions::revoke_session(&state.pool, &auth_user.session_jti, "sign_out").await?;

    log_activity(
        state.pool.clone(),
        auth_user.user_id,
        ActivityAction::SignOut,
        extract_ip_address(&headers),
    );

    Ok((
        [(header::SET_COOKIE, clear_session_cookie(state.config.cookie_secure))],
        Json(json!({ "success": true })),
    )
        .into_response())
}

/// GET /api/auth/verify-email?token=...
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let Some(user_id) =
        tokens::consume(&state.pool, TokenPurpose::EmailVerification, &query.token).await?
    else {
        return Err(ApiError::Validation("Invalid or expired token".to_string()));
    };

    if !users::mark_email_verified(&state.pool, user_id).await? {
        return Err(ApiError::NotFound);
    }
    log_activity(state.pool.clone(), user_id, ActivityAction::EmailVerified, None);
    tracing::info!(user_id = %user_id, "Email verified");

    Ok(done_or_redirect(
        &state,
        query.callback_url.as_deref(),
        "Email verified",
    ))
}

/// POST /api/auth/forget-password
///
/// Always succeeds so the response does not reveal whether the address exists.
pub async fn forget_password(
    State(state): State<AppState>,
    Json(req): Json<ForgetPasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = match users::normalize_email(&req.email) {
        Ok(email) => users::find_by_email(&state.pool, &email).await?,
        Err(_) => None,
    };

    if let Some(user) = user {
        let token = tokens::issue(&state.pool, TokenPurpose::PasswordReset, user.id).await?;
        send_in_background(
            &state,
            state.auth_emails.password_reset(&user.email, &user.name, &token),
        );
        tracing::info!(user_id = %user.id, "Password reset requested");
    }

    Ok(Json(json!({
        "success": true,
        "message": "If an account exists for this email, a reset link has been sent",
    })))
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_password_strength(&req.new_password).map_err(ApiError::Validation)?;

    let Some(user_id) =
        tokens::consume(&state.pool, TokenPurpose::PasswordReset, &req.token).await?
    else {
        return Err(ApiError::Validation("Invalid or expired token".to_string()));
    };

    let password_hash = hash_off_thread(req.new_password).await?;
    users::set_password(&state.pool, user_id, &password_hash).await?;
    let revoked = sessions::revoke_all_sessions(&state.pool, user_id, "password_reset").await?;

    log_activity(
        state.pool.clone(),
        user_id,
        ActivityAction::PasswordReset,
        extract_ip_address(&headers),
    );
    tracing::info!(user_id = %user_id, sessions_revoked = revoked, "Password reset");

    Ok(Json(json!({ "success": true })))
}

/// POST /api/auth/delete-user
///
/// Emails a confirmation link; nothing is deleted until it is followed.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = users::find_by_id(&state.pool, auth_user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let token = tokens::issue(&state.pool, TokenPurpose::DeleteAccount, user.id).await?;
    send_in_background(
        &state,
        state.auth_emails.delete_account(&user.email, &user.name, &token),
    );
    tracing::info!(user_id = %user.id, "Account deletion requested");

    Ok(Json(json!({
        "success": true,
        "message": "Verification email sent",
    })))
}

/// Stop billing ahead of an account deletion
///
/// A live subscription is set to cancel at period end. Users without one
/// pass straight through.
async fn release_billing(billing: Option<&BillingService>, user_id: Uuid) -> ApiResult<()> {
    let Some(billing) = billing else {
        return Ok(());
    };
    match billing
        .subscriptions
        .cancel(user_id, OffsetDateTime::now_utc())
        .await
    {
        Ok(_) => {
            tracing::info!(user_id = %user_id, "Subscription cancelled before account deletion");
            Ok(())
        }
        Err(
            BillingError::NoActiveSubscription
            | BillingError::AlreadyScheduled
            | BillingError::UserNotFound(_),
        ) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// GET /api/auth/delete-user/callback?token=...
///
/// The token is only redeemed once billing is released, so a Stripe outage
/// leaves the emailed link usable.
pub async fn delete_user_callback(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let invalid = || ApiError::Validation("Invalid or expired token".to_string());

    let user_id = tokens::peek(&state.pool, TokenPurpose::DeleteAccount, &query.token)
        .await?
        .ok_or_else(invalid)?;

    release_billing(state.billing.as_deref(), user_id).await?;

    // Another redemption may have won in between
    let redeemed = tokens::consume(&state.pool, TokenPurpose::DeleteAccount, &query.token).await?;
    if redeemed != Some(user_id) {
        return Err(invalid());
    }

    sessions::revoke_all_sessions(&state.pool, user_id, "account_deleted").await?;
    if !users::delete(&state.pool, user_id).await? {
        return Err(ApiError::NotFound);
    }
    tracing::info!(user_id = %user_id, "Account deleted");

    let mut response = done_or_redirect(&state, query.callback_url.as_deref(), "Account deleted");
    if let Ok(cookie) = clear_session_cookie(state.config.cookie_secure).parse() {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
