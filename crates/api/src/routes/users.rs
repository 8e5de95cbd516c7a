//! Current-user routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
    users::{self, UserView},
};

/// Where Stripe sends the user back to
pub(crate) fn billing_url(state: &AppState) -> String {
    format!("{}/dashboard/billing", state.config.app_url.trim_end_matches('/'))
}

/// GET /api/v1/users/session
pub async fn session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let user = users::find_by_id(&state.pool, auth_user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(json!({
        "success": true,
        "data": { "user": UserView::from_record(&user, OffsetDateTime::now_utc()) }
    })))
}

/// GET /api/v1/users/stripe/{price_id}
///
/// Billing portal for paying users, a new checkout for everyone else.
pub async fn stripe_redirect(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(price_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let url = billing
        .subscriptions
        .checkout_or_portal(
            auth_user.user_id,
            &price_id,
            &billing_url(&state),
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(json!({ "success": true, "data": { "url": url } })))
}

/// GET /api/stripe/open-portal/{user_stripe_id}
pub async fn open_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_stripe_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let url = billing
        .subscriptions
        .portal(auth_user.user_id, &user_stripe_id, &billing_url(&state))
        .await?;

    Ok(Json(json!({ "success": true, "data": { "url": url } })))
}
