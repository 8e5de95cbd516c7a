//! In-process billing doubles
//!
//! Used by the tests of this crate and the API crate, and handy for running
//! the server locally without Postgres or Stripe.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionObject, SubscriptionStatus};
use crate::history::{HistoryEntry, HistoryRecord};
use crate::lifecycle::BillingSnapshot;
use crate::provider::{CheckoutRequest, CheckoutSessionCreated, PaymentProvider};
use crate::store::{BillingStore, EventClaim, PROCESSING_TIMEOUT_MINUTES};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct EventRow {
    result: String,
    started_at: OffsetDateTime,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredHistory {
    user_id: Uuid,
    invoice_id: Option<String>,
    record: HistoryRecord,
}

#[derive(Debug, Default)]
struct StoreState {
    users: HashMap<Uuid, BillingSnapshot>,
    history: Vec<StoredHistory>,
    events: HashMap<String, EventRow>,
}

#[derive(Debug, Default)]
pub struct MemoryBillingStore {
    state: Mutex<StoreState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: BillingSnapshot) {
        lock(&self.state).users.insert(snapshot.user_id, snapshot);
    }

    pub fn get(&self, user_id: Uuid) -> Option<BillingSnapshot> {
        lock(&self.state).users.get(&user_id).cloned()
    }

    /// History actions of one user, oldest first
    pub fn actions(&self, user_id: Uuid) -> Vec<String> {
        lock(&self.state)
            .history
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.record.action.clone())
            .collect()
    }

    /// `processing`, `success` or `error`
    pub fn event_result(&self, event_id: &str) -> Option<String> {
        lock(&self.state)
            .events
            .get(event_id)
            .map(|row| row.result.clone())
    }

    pub fn event_error(&self, event_id: &str) -> Option<String> {
        lock(&self.state)
            .events
            .get(event_id)
            .and_then(|row| row.error.clone())
    }

    fn find(&self, predicate: impl Fn(&BillingSnapshot) -> bool) -> Option<BillingSnapshot> {
        lock(&self.state).users.values().find(|s| predicate(s)).cloned()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn snapshot(&self, user_id: Uuid) -> BillingResult<Option<BillingSnapshot>> {
        Ok(self.get(user_id))
    }

    async fn snapshot_by_customer(&self, customer_id: &str) -> BillingResult<Option<BillingSnapshot>> {
        Ok(self.find(|s| s.stripe_customer_id.as_deref() == Some(customer_id)))
    }

    async fn snapshot_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingSnapshot>> {
        Ok(self.find(|s| s.stripe_subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn save(
        &self,
        snapshot: Option<&BillingSnapshot>,
        history: &[HistoryEntry],
    ) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if let Some(s) = snapshot {
            match state.users.get(&s.user_id) {
                None => return Err(BillingError::UserNotFound(s.user_id.to_string())),
                Some(stored) if stored.version != s.version => {
                    return Err(BillingError::ConcurrentUpdate(s.user_id.to_string()));
                }
                Some(_) => {}
            }
            state.users.insert(
                s.user_id,
                BillingSnapshot {
                    version: s.version + 1,
                    ..s.clone()
                },
            );
        }
        for entry in history {
            let repeated = entry.stripe_invoice_id.is_some()
                && state.history.iter().any(|row| {
                    row.invoice_id == entry.stripe_invoice_id
                        && row.record.action == entry.action.as_str()
                });
            if repeated {
                continue;
            }
            state.history.push(StoredHistory {
                user_id: entry.user_id,
                invoice_id: entry.stripe_invoice_id.clone(),
                record: HistoryRecord {
                    id: Uuid::new_v4(),
                    action: entry.action.as_str().to_string(),
                    old_plan: entry.old_plan.clone(),
                    new_plan: entry.new_plan.clone(),
                    amount: entry.amount.clone(),
                    currency: entry.currency.clone(),
                    status: entry.status.clone(),
                    timestamp: entry.timestamp,
                },
            });
        }
        Ok(())
    }

    async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<HistoryRecord>> {
        let state = lock(&self.state);
        let mut records: Vec<HistoryRecord> = state
            .history
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.record.clone())
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        records.reverse();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(records)
    }

    async fn active_trials(&self) -> BillingResult<Vec<BillingSnapshot>> {
        Ok(lock(&self.state)
            .users
            .values()
            .filter(|s| s.is_trial_active && s.trial_end_date.is_some())
            .cloned()
            .collect())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let now = OffsetDateTime::now_utc();
        let timeout = Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));
        let mut state = lock(&self.state);

        let claimable = match state.events.get(event_id) {
            None => true,
            Some(row) if row.result == "error" => true,
            Some(row) => row.result == "processing" && row.started_at < now - timeout,
        };

        if !claimable {
            return Ok(EventClaim::Duplicate {
                status: state.events.get(event_id).map(|row| row.result.clone()),
            });
        }

        state.events.insert(
            event_id.to_string(),
            EventRow {
                result: "processing".to_string(),
                started_at: now,
                error: None,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        if let Some(row) = lock(&self.state).events.get_mut(event_id) {
            row.result = if error.is_some() { "error" } else { "success" }.to_string();
            row.error = error.map(str::to_string);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    subscriptions: HashMap<String, SubscriptionObject>,
    checkouts: Vec<CheckoutRequest>,
    portals: Vec<(String, String)>,
    unavailable: bool,
}

/// Stripe stand-in holding subscriptions in memory
#[derive(Debug, Default)]
pub struct MemoryPaymentProvider {
    state: Mutex<ProviderState>,
}

impl MemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: SubscriptionObject) {
        lock(&self.state)
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionObject> {
        lock(&self.state).subscriptions.get(id).cloned()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        lock(&self.state).checkouts.clone()
    }

    /// `(customer_id, return_url)` of every portal session
    pub fn portals(&self) -> Vec<(String, String)> {
        lock(&self.state).portals.clone()
    }

    /// Make every call fail like a Stripe outage
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    fn state(&self) -> BillingResult<MutexGuard<'_, ProviderState>> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(BillingError::StripeApi("provider unavailable".to_string()));
        }
        Ok(state)
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut SubscriptionObject),
    ) -> BillingResult<SubscriptionObject> {
        let mut state = self.state()?;
        let sub = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: '{id}'")))?;
        apply(sub);
        Ok(sub.clone())
    }
}

#[async_trait]
impl PaymentProvider for MemoryPaymentProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionCreated> {
        let mut state = self.state()?;
        state.checkouts.push(request.clone());
        let id = format!("cs_test_{}", state.checkouts.len());
        Ok(CheckoutSessionCreated {
            url: Some(format!("https://checkout.stripe.test/{id}")),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let mut state = self.state()?;
        state
            .portals
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(format!("https://billing.stripe.test/{customer_id}"))
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<SubscriptionObject> {
        self.state()?
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: '{id}'")))
    }

    async fn change_subscription_price(
        &self,
        id: &str,
        price_id: &str,
    ) -> BillingResult<SubscriptionObject> {
        self.update(id, |sub| {
            if let Some(price) = sub.items.data.first_mut().and_then(|item| item.price.as_mut()) {
                price.id = price_id.to_string();
            }
        })
    }

    async fn cancel_subscription_at_period_end(&self, id: &str) -> BillingResult<SubscriptionObject> {
        self.update(id, |sub| {
            if sub.status.is_live() || sub.status == SubscriptionStatus::Incomplete {
                sub.cancel_at_period_end = true;
            }
        })
    }
}
