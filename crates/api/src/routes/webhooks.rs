//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use boilerkit_billing::BillingError;
use serde_json::json;

use crate::{error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

fn webhook_error() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": "Webhook Error" })),
    )
        .into_response()
}

/// POST /api/stripe/webhook
///
/// Bad signatures and payloads get 400 so Stripe stops retrying them;
/// transient failures get 500 so it tries again.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let billing = match state.billing() {
        Ok(billing) => billing,
        Err(e) => return e.into_response(),
    };

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!("Stripe webhook without signature header");
        return webhook_error();
    };

    match billing.webhooks.handle(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = ?outcome, "Stripe webhook acknowledged");
            Json(json!({ "success": true })).into_response()
        }
        Err(e @ (BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_))) => {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            webhook_error()
        }
        Err(e) if e.is_retryable() => {
            ApiError::Internal(format!("Webhook processing failed: {e}")).into_response()
        }
        Err(e) => {
            // Permanent failure; acknowledge so Stripe stops redelivering
            tracing::error!(error = %e, "Stripe webhook could not be applied");
            Json(json!({ "success": true })).into_response()
        }
    }
}
