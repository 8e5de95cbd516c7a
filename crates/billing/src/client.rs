//! Stripe client configuration and API calls

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, Client, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CustomerId, Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
// The crate root also exports `subscription_item::SubscriptionProrationBehavior`
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionObject;
use crate::provider::{CheckoutRequest, CheckoutSessionCreated, PaymentProvider};

const DEFAULT_TRIAL_PERIOD_DAYS: u32 = 14;
const DEFAULT_ACTION_URL: &str = "https://boilerkit.dev/subscription";

/// Stripe price ids for the paid plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceIds {
    pub pro_monthly: String,
    pub pro_yearly: String,
}

impl PriceIds {
    pub fn from_env() -> Self {
        Self {
            pro_monthly: std::env::var("STRIPE_PRO_MONTHLY_PRICE_ID").unwrap_or_default(),
            pro_yearly: std::env::var("STRIPE_PRO_YEARLY_PRICE_ID").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Trial length granted on a first checkout
    pub trial_period_days: u32,
    /// Where notification emails send users to manage their subscription
    pub action_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::NotConfigured("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
            BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;

        let trial_period_days = match std::env::var("TRIAL_PERIOD_DAYS") {
            Ok(v) => v.parse().map_err(|_| {
                BillingError::NotConfigured(format!("TRIAL_PERIOD_DAYS is not a number: {v}"))
            })?,
            Err(_) => DEFAULT_TRIAL_PERIOD_DAYS,
        };

        let action_url = std::env::var("SUBSCRIPTION_ACTION_URL")
            .unwrap_or_else(|_| DEFAULT_ACTION_URL.to_string());

        let price_ids = PriceIds::from_env();
        if price_ids.pro_monthly.is_empty() || price_ids.pro_yearly.is_empty() {
            tracing::warn!("Stripe price ids not fully configured - checkout for missing intervals will be rejected");
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
            trial_period_days,
            action_url,
        })
    }

    /// Configuration for tests and local tooling
    pub fn for_testing(webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: "sk_test_boilerkit".to_string(),
            webhook_secret: webhook_secret.into(),
            price_ids: PriceIds {
                pro_monthly: "price_pro_monthly".to_string(),
                pro_yearly: "price_pro_yearly".to_string(),
            },
            trial_period_days: DEFAULT_TRIAL_PERIOD_DAYS,
            action_url: DEFAULT_ACTION_URL.to_string(),
        }
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(&config.secret_key);
        Self { inner, config }
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|_| BillingError::InvalidInput(format!("invalid subscription id: {id}")))
}

/// Re-read an SDK subscription through our own event model
fn to_object(subscription: &Subscription) -> BillingResult<SubscriptionObject> {
    let value = serde_json::to_value(subscription)?;
    Ok(serde_json::from_value(value)?)
}

/// Swap the price of a subscription item, prorating the difference
fn price_change<'a>(item_id: String, price_id: &str) -> UpdateSubscription<'a> {
    UpdateSubscription {
        items: Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]),
        proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
        ..Default::default()
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionCreated> {
        let user_id = request.user_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), user_id.clone());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&user_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            trial_period_days: request.trial_period_days,
            ..Default::default()
        });

        match &request.customer_id {
            Some(customer) => {
                let customer = customer.parse::<CustomerId>().map_err(|_| {
                    BillingError::InvalidInput(format!("invalid customer id: {customer}"))
                })?;
                params.customer = Some(customer);
            }
            None => params.customer_email = Some(&request.email),
        }

        let session = CheckoutSession::create(&self.inner, params).await?;

        tracing::info!(
            user_id = %request.user_id,
            session_id = %session.id,
            price_id = %request.price_id,
            trial_days = ?request.trial_period_days,
            "Created checkout session"
        );

        Ok(CheckoutSessionCreated {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|_| BillingError::InvalidInput(format!("invalid customer id: {customer_id}")))?;

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.inner, params).await?;
        tracing::info!(customer_id = %customer_id, "Created billing portal session");
        Ok(session.url)
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<SubscriptionObject> {
        let subscription = Subscription::retrieve(&self.inner, &subscription_id(id)?, &[]).await?;
        to_object(&subscription)
    }

    async fn change_subscription_price(
        &self,
        id: &str,
        price_id: &str,
    ) -> BillingResult<SubscriptionObject> {
        let sub_id = subscription_id(id)?;
        let current = Subscription::retrieve(&self.inner, &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let updated = Subscription::update(&self.inner, &sub_id, price_change(item_id, price_id)).await?;
        tracing::info!(subscription_id = %id, price_id = %price_id, "Changed subscription price");
        to_object(&updated)
    }

    async fn cancel_subscription_at_period_end(&self, id: &str) -> BillingResult<SubscriptionObject> {
        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        let updated = Subscription::update(&self.inner, &subscription_id(id)?, params).await?;
        tracing::info!(subscription_id = %id, "Scheduled subscription cancellation");
        to_object(&updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_change_prorates_single_item() {
        let params = price_change("si_123".to_string(), "price_pro_yearly");

        assert_eq!(
            params.proration_behavior,
            Some(SubscriptionProrationBehavior::CreateProrations)
        );
        let items = params.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_deref(), Some("si_123"));
        assert_eq!(items[0].price.as_deref(), Some("price_pro_yearly"));
    }
}
