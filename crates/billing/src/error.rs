//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Billing is not configured: {0}")]
    NotConfigured(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Unknown price id: {0}")]
    InvalidPrice(String),

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("User already has an active subscription")]
    AlreadySubscribed,

    #[error("Subscription is already set to cancel at period end")]
    AlreadyScheduled,

    #[error("Subscription is already on this plan")]
    SamePlan,

    #[error("Customer does not belong to this user")]
    CustomerMismatch,

    #[error("Trial has already been used")]
    TrialAlreadyUsed,

    #[error("Billing state changed concurrently for user {0}")]
    ConcurrentUpdate(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors a webhook sender should retry
    ///
    /// Everything else is a permanent rejection of the request or event.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_)
                | BillingError::Database(_)
                | BillingError::ConcurrentUpdate(_)
                | BillingError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(BillingError::StripeApi("timeout".into()).is_retryable());
        assert!(BillingError::ConcurrentUpdate("u1".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::InvalidPrice("price_x".into()).is_retryable());
        assert!(!BillingError::TrialAlreadyUsed.is_retryable());
    }
}
