//! API error type and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use boilerkit_billing::BillingError;
use serde_json::json;

use crate::auth::AuthError;
use crate::storage::StorageError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Message is logged, never returned
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message
    fn public_message(&self) -> String {
        match self {
            ApiError::Database(_) | ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "success": false,
            "error": self.public_message(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotConfigured(_) => {
                ApiError::ServiceUnavailable("Billing is not available".to_string())
            }
            BillingError::UserNotFound(_) => ApiError::NotFound,
            BillingError::CustomerMismatch => ApiError::Forbidden,
            BillingError::InvalidPrice(_)
            | BillingError::InvalidInput(_)
            | BillingError::NoActiveSubscription
            | BillingError::SamePlan
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayloadInvalid(_) => ApiError::Validation(e.to_string()),
            BillingError::AlreadySubscribed
            | BillingError::AlreadyScheduled
            | BillingError::TrialAlreadyUsed => ApiError::Conflict(e.to_string()),
            BillingError::ConcurrentUpdate(_) => ApiError::Conflict(
                "Billing state is being updated, please retry".to_string(),
            ),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::StripeApi(_) | BillingError::Internal(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidPath(_) | StorageError::Empty => ApiError::Validation(e.to_string()),
            StorageError::NotFound(_) => ApiError::NotFound,
            StorageError::TooLarge { .. } => ApiError::PayloadTooLarge,
            StorageError::Io(_) | StorageError::Transport(_) | StorageError::Rejected { .. } => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingAuth | AuthError::InvalidToken | AuthError::SessionRevoked => {
                ApiError::Unauthorized
            }
            AuthError::Banned(_) | AuthError::InsufficientPermissions => ApiError::Forbidden,
            AuthError::DatabaseError => ApiError::Database("auth lookup failed".to_string()),
            AuthError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::Validation("Password too short".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Password too short");
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let response = ApiError::Database("relation users does not exist".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["code"], 500);
    }

    #[test]
    fn test_billing_error_mapping() {
        let cases = [
            (BillingError::NotConfigured("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (BillingError::UserNotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::CustomerMismatch, StatusCode::FORBIDDEN),
            (BillingError::InvalidPrice("price_x".into()), StatusCode::BAD_REQUEST),
            (BillingError::NoActiveSubscription, StatusCode::BAD_REQUEST),
            (BillingError::AlreadySubscribed, StatusCode::CONFLICT),
            (BillingError::TrialAlreadyUsed, StatusCode::CONFLICT),
            (BillingError::ConcurrentUpdate("x".into()), StatusCode::CONFLICT),
            (BillingError::StripeApi("timeout".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(
            ApiError::from(StorageError::TooLarge { size: 10, limit: 5 }).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(StorageError::InvalidPath("../etc".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StorageError::NotFound("avatars/a.png".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
