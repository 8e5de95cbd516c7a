//! Subscription routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use boilerkit_billing::subscriptions::DEFAULT_HISTORY_LIMIT;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::{auth::safe_callback, users::billing_url},
    state::AppState,
};

/// Longest card-less trial a user can start
const MAX_TRIAL_DAYS: u32 = 90;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub price_id: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSubscriptionRequest {
    pub price_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TrialQuery {
    pub days: Option<u32>,
}

/// Client redirect if it stays on the frontend origin, `fallback` when absent
fn redirect_url(state: &AppState, requested: Option<&str>, fallback: String) -> ApiResult<String> {
    match requested {
        None => Ok(fallback),
        Some(url) => safe_callback(&state.config.app_url, Some(url))
            .ok_or_else(|| ApiError::Validation("Redirect URL must point to the application".to_string())),
    }
}

/// POST /api/v1/subscription/create
pub async fn create(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let base = billing_url(&state);
    let success_url = redirect_url(&state, req.success_url.as_deref(), format!("{base}?checkout=success"))?;
    let cancel_url = redirect_url(&state, req.cancel_url.as_deref(), format!("{base}?checkout=cancel"))?;

    let session = billing
        .subscriptions
        .create_checkout(auth_user.user_id, &req.price_id, &success_url, &cancel_url)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, session_id = %session.id, "Checkout session created");

    Ok(Json(json!({
        "success": true,
        "data": { "sessionId": session.id, "url": session.url }
    })))
}

/// GET /api/v1/subscription/status
pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let view = state
        .billing()?
        .subscriptions
        .status(auth_user.user_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(json!({ "success": true, "data": view })))
}

/// POST /api/v1/subscription/change
pub async fn change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangeSubscriptionRequest>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let now = OffsetDateTime::now_utc();
    let snapshot = billing
        .subscriptions
        .change_plan(auth_user.user_id, &req.price_id, now)
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": billing.subscriptions.status_view(&snapshot, now)
    })))
}

/// POST /api/v1/subscription/cancel
///
/// Access continues until the end of the paid period.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let now = OffsetDateTime::now_utc();
    let snapshot = billing.subscriptions.cancel(auth_user.user_id, now).await?;

    Ok(Json(json!({
        "success": true,
        "data": billing.subscriptions.status_view(&snapshot, now)
    })))
}

/// GET /api/v1/subscription/history
pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let records = state
        .billing()?
        .subscriptions
        .history(auth_user.user_id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await?;

    Ok(Json(json!({ "success": true, "data": records })))
}

/// POST /api/v1/subscription/trial?days=N
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TrialQuery>,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;
    let days = query.days.unwrap_or(if state.config.signup_trial_days > 0 {
        state.config.signup_trial_days
    } else {
        billing.config.trial_period_days
    });
    if days == 0 || days > MAX_TRIAL_DAYS {
        return Err(ApiError::Validation(format!(
            "Trial length must be between 1 and {MAX_TRIAL_DAYS} days"
        )));
    }

    let now = OffsetDateTime::now_utc();
    let snapshot = billing
        .subscriptions
        .start_trial(auth_user.user_id, days, now)
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": billing.subscriptions.status_view(&snapshot, now)
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use boilerkit_billing::{BillingSnapshot, MemoryBillingStore, MemoryPaymentProvider};
    use uuid::Uuid;

    use super::*;
    use crate::routes::test_support::{auth_user, memory_billing, state};

    fn setup() -> (Arc<MemoryBillingStore>, Arc<MemoryPaymentProvider>, AppState, Uuid) {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(MemoryPaymentProvider::new());
        let user_id = Uuid::new_v4();
        store.insert(BillingSnapshot::new(user_id, "jane@example.com", "Jane"));
        let state = state(Some(memory_billing(store.clone(), provider.clone())));
        (store, provider, state, user_id)
    }

    #[tokio::test]
    async fn test_create_uses_default_redirects() {
        let (_, provider, state, user_id) = setup();
        let Json(body) = create(
            State(state),
            Extension(auth_user(user_id)),
            Json(CreateSubscriptionRequest {
                price_id: "price_pro_yearly".to_string(),
                success_url: None,
                cancel_url: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(body["data"]["sessionId"], "cs_test_1");
        let checkout = &provider.checkouts()[0];
        assert_eq!(
            checkout.success_url,
            "http://localhost:3000/dashboard/billing?checkout=success"
        );
        assert_eq!(
            checkout.cancel_url,
            "http://localhost:3000/dashboard/billing?checkout=cancel"
        );
        assert_eq!(checkout.trial_period_days, Some(14));
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_redirect() {
        let (_, provider, state, user_id) = setup();
        let err = create(
            State(state),
            Extension(auth_user(user_id)),
            Json(CreateSubscriptionRequest {
                price_id: "price_pro_monthly".to_string(),
                success_url: Some("https://evil.example/thanks".to_string()),
                cancel_url: None,
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(provider.checkouts().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_price() {
        let (_, _, state, user_id) = setup();
        let err = create(
            State(state),
            Extension(auth_user(user_id)),
            Json(CreateSubscriptionRequest {
                price_id: "price_unknown".to_string(),
                success_url: None,
                cancel_url: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let (_, _, state, user_id) = setup();
        let err = cancel(State(state), Extension(auth_user(user_id)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trial_then_status() {
        let (store, _, state, user_id) = setup();
        let Json(body) = start_trial(
            State(state.clone()),
            Extension(auth_user(user_id)),
            Query(TrialQuery { days: Some(7) }),
        )
        .await
        .unwrap();
        assert_eq!(body["data"]["isTrialActive"], true);
        assert!(store.get(user_id).unwrap().has_used_trial);

        let Json(status_body) = status(State(state.clone()), Extension(auth_user(user_id)))
            .await
            .unwrap();
        assert_eq!(status_body["data"]["isTrialActive"], true);

        let err = start_trial(
            State(state),
            Extension(auth_user(user_id)),
            Query(TrialQuery { days: Some(7) }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_trial_length_bounds() {
        let (_, _, state, user_id) = setup();
        for days in [0, MAX_TRIAL_DAYS + 1] {
            let err = start_trial(
                State(state.clone()),
                Extension(auth_user(user_id)),
                Query(TrialQuery { days: Some(days) }),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
    }
}
