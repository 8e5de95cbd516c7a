//! Payment provider seam
//!
//! Everything the billing services need from Stripe goes through
//! [`PaymentProvider`] so the lifecycle can be exercised without the network.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::SubscriptionObject;

/// Parameters of a subscription checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub email: String,
    /// Existing Stripe customer to reuse
    pub customer_id: Option<String>,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Only set for users that never had a trial
    pub trial_period_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionCreated {
    pub id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionCreated>;

    /// Returns the portal URL
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
        -> BillingResult<String>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionObject>;

    /// Swap the price of the subscription's only item
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<SubscriptionObject>;

    async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionObject>;
}
