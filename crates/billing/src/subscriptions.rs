//! Subscription management
//!
//! User-initiated operations. Provider responses are reconciled through the
//! same lifecycle functions as webhooks, so the user row is current before the
//! corresponding webhook arrives and the webhook becomes a no-op.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingNotifier;
use crate::error::{BillingError, BillingResult};
use crate::history::HistoryRecord;
use crate::events::SubscriptionObject;
use crate::lifecycle::{BillingSnapshot, LifecycleState, Reconciler, Reconciliation};
use crate::plans::{BillingInterval, FreePlan, PlanCatalog};
use crate::provider::{CheckoutRequest, CheckoutSessionCreated, PaymentProvider};
use crate::store::{self, BillingStore};

/// Default number of history rows returned
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Paid access check used across the API
pub fn is_pro(snapshot: &BillingSnapshot, now: OffsetDateTime) -> bool {
    snapshot.is_pro(now)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    pub title: String,
    pub description: String,
    pub benefits: Vec<String>,
    pub is_paid: bool,
    pub interval: Option<BillingInterval>,
    pub is_canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusView {
    pub is_trial_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    pub status: &'static str,
    pub plan: PlanView,
}

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: BillingNotifier,
    catalog: Arc<PlanCatalog>,
    trial_period_days: u32,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: BillingNotifier,
        catalog: Arc<PlanCatalog>,
        trial_period_days: u32,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            catalog,
            trial_period_days,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub async fn snapshot(&self, user_id: Uuid) -> BillingResult<BillingSnapshot> {
        self.store
            .snapshot(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    /// Start a Stripe Checkout for `price_id`
    pub async fn create_checkout(
        &self,
        user_id: Uuid,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSessionCreated> {
        if !self.catalog.is_known(price_id) {
            return Err(BillingError::InvalidPrice(price_id.to_string()));
        }

        let snapshot = self.snapshot(user_id).await?;
        if snapshot.has_live_subscription() {
            return Err(BillingError::AlreadySubscribed);
        }

        let trial_period_days = (!snapshot.has_used_trial && self.trial_period_days > 0)
            .then_some(self.trial_period_days);

        let request = CheckoutRequest {
            user_id,
            email: snapshot.email.clone(),
            customer_id: snapshot.stripe_customer_id.clone(),
            price_id: price_id.to_string(),
            success_url: success_url.to_string(),
            cancel_url: cancel_url.to_string(),
            trial_period_days,
        };

        self.provider.create_checkout_session(&request).await
    }

    pub async fn status(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<SubscriptionStatusView> {
        let snapshot = self.snapshot(user_id).await?;
        Ok(self.status_view(&snapshot, now))
    }

    pub fn status_view(&self, snapshot: &BillingSnapshot, now: OffsetDateTime) -> SubscriptionStatusView {
        let paid_plan = snapshot
            .is_pro(now)
            .then(|| snapshot.stripe_price_id.as_deref())
            .flatten()
            .and_then(|price| self.catalog.resolve(price));

        let plan = match paid_plan {
            Some((plan, interval)) => PlanView {
                title: plan.title.clone(),
                description: plan.description.clone(),
                benefits: plan.benefits.clone(),
                is_paid: !snapshot.trial_running(now),
                interval: Some(interval),
                is_canceled: snapshot.cancel_at_period_end,
            },
            None => PlanView {
                title: FreePlan::TITLE.to_string(),
                description: FreePlan::DESCRIPTION.to_string(),
                benefits: FreePlan::benefits(),
                is_paid: false,
                interval: None,
                is_canceled: false,
            },
        };

        SubscriptionStatusView {
            is_trial_active: snapshot.trial_running(now),
            trial_start_date: snapshot.trial_start_date,
            trial_end_date: snapshot.trial_end_date,
            status: LifecycleState::of(snapshot, now).as_str(),
            plan,
        }
    }

    /// Move the live subscription to another price
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_price_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<BillingSnapshot> {
        if !self.catalog.is_known(new_price_id) {
            return Err(BillingError::InvalidPrice(new_price_id.to_string()));
        }

        let snapshot = self.snapshot(user_id).await?;
        let subscription_id = match (&snapshot.stripe_subscription_id, snapshot.has_live_subscription()) {
            (Some(id), true) => id.clone(),
            _ => return Err(BillingError::NoActiveSubscription),
        };
        if snapshot.stripe_price_id.as_deref() == Some(new_price_id) {
            return Err(BillingError::SamePlan);
        }

        let updated = self
            .provider
            .change_subscription_price(&subscription_id, new_price_id)
            .await?;

        let old_price = snapshot.stripe_price_id.clone();
        let rec = self.apply_response(snapshot, &updated, now).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            old_price = ?old_price,
            new_price = %new_price_id,
            "Subscription plan changed"
        );
        Ok(rec.next)
    }

    /// Cancel at the end of the current period
    pub async fn cancel(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<BillingSnapshot> {
        let snapshot = self.snapshot(user_id).await?;
        let subscription_id = match (&snapshot.stripe_subscription_id, snapshot.has_live_subscription()) {
            (Some(id), true) => id.clone(),
            _ => return Err(BillingError::NoActiveSubscription),
        };
        if snapshot.cancel_at_period_end {
            return Err(BillingError::AlreadyScheduled);
        }

        let updated = self
            .provider
            .cancel_subscription_at_period_end(&subscription_id)
            .await?;

        let rec = self.apply_response(snapshot, &updated, now).await?;

        tracing::info!(user_id = %user_id, subscription_id = %subscription_id, "Subscription set to cancel at period end");
        Ok(rec.next)
    }

    /// Portal for paying customers, checkout for everyone else
    pub async fn checkout_or_portal(
        &self,
        user_id: Uuid,
        price_id: &str,
        billing_url: &str,
        now: OffsetDateTime,
    ) -> BillingResult<String> {
        let snapshot = self.snapshot(user_id).await?;

        if let (true, Some(customer)) = (snapshot.is_pro(now), &snapshot.stripe_customer_id) {
            return self.provider.create_portal_session(customer, billing_url).await;
        }

        let session = self
            .create_checkout(user_id, price_id, billing_url, billing_url)
            .await?;
        session
            .url
            .ok_or_else(|| BillingError::Internal("No checkout URL returned".to_string()))
    }

    /// Billing portal for a customer the user owns
    pub async fn portal(
        &self,
        user_id: Uuid,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let snapshot = self.snapshot(user_id).await?;
        if snapshot.stripe_customer_id.as_deref() != Some(customer_id) {
            tracing::warn!(user_id = %user_id, customer_id = %customer_id, "Portal requested for a customer the user does not own");
            return Err(BillingError::CustomerMismatch);
        }
        self.provider.create_portal_session(customer_id, return_url).await
    }

    /// Card-less trial
    pub async fn start_trial(
        &self,
        user_id: Uuid,
        days: u32,
        now: OffsetDateTime,
    ) -> BillingResult<BillingSnapshot> {
        let snapshot = self.snapshot(user_id).await?;
        let reconciler = Reconciler::new(&self.catalog);
        let rec = store::reconcile(self.store.as_ref(), &self.notifier, snapshot, |s| {
            reconciler.start_local_trial(s, days, now)
        })
        .await?;
        tracing::info!(user_id = %user_id, days = days, "Trial started");
        Ok(rec.next)
    }

    /// Persist what Stripe returned for a call made on the user's behalf
    async fn apply_response(
        &self,
        snapshot: BillingSnapshot,
        updated: &SubscriptionObject,
        now: OffsetDateTime,
    ) -> BillingResult<Reconciliation> {
        let reconciler = Reconciler::new(&self.catalog);
        store::reconcile(self.store.as_ref(), &self.notifier, snapshot, |s| {
            Ok(reconciler.apply_api_response(s, updated, now))
        })
        .await
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<HistoryRecord>> {
        self.store.history(user_id, limit.clamp(1, 500)).await
    }
}
