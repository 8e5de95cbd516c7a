//! Subscription lifecycle reconciliation
//!
//! Billing state lives on the user row. Every inbound Stripe object is folded
//! into a [`BillingSnapshot`] by a pure function that returns the next
//! snapshot together with the history rows and notifications the transition
//! produced. Callers persist and deliver those; nothing here touches I/O.
//!
//! ## Ordering
//!
//! Stripe does not guarantee delivery order. Subscription events older than
//! `last_billing_event_at` are skipped, and a live subscription never moves
//! back to `incomplete`. Invoice events only ever extend the paid period.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSessionObject, InvoiceObject, SubscriptionObject, SubscriptionStatus};
use crate::history::{HistoryAction, HistoryEntry};
use crate::plans::PlanCatalog;

/// Trial reminders already sent, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrialNotice {
    /// A few days left
    Ending,
    LastDay,
    Ended,
}

impl TrialNotice {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialNotice::Ending => "ending",
            TrialNotice::LastDay => "last_day",
            TrialNotice::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ending" => Some(TrialNotice::Ending),
            "last_day" => Some(TrialNotice::LastDay),
            "ended" => Some(TrialNotice::Ended),
            _ => None,
        }
    }

    /// The reminder a trial ending at `trial_end` calls for at `now`
    pub fn due(trial_end: OffsetDateTime, now: OffsetDateTime) -> Option<Self> {
        let remaining = trial_end - now;
        if remaining <= Duration::ZERO {
            Some(TrialNotice::Ended)
        } else if remaining < Duration::days(1) {
            Some(TrialNotice::LastDay)
        } else if remaining <= Duration::days(3) {
            Some(TrialNotice::Ending)
        } else {
            None
        }
    }
}

/// Whole days left until `end`, rounded up, never below one
pub fn days_left(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (end - now).whole_seconds();
    let days = seconds.div_euclid(86_400) + i64::from(seconds.rem_euclid(86_400) > 0);
    days.max(1)
}

pub(crate) fn from_unix(seconds: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

/// Billing columns of one user row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSnapshot {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub is_trial_active: bool,
    pub has_used_trial: bool,
    pub trial_start_date: Option<OffsetDateTime>,
    pub trial_end_date: Option<OffsetDateTime>,
    pub trial_last_notice: Option<TrialNotice>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_current_period_end: Option<OffsetDateTime>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: bool,
    pub last_billing_event_at: Option<OffsetDateTime>,
    /// Row version the snapshot was read at
    pub version: i64,
}

impl BillingSnapshot {
    pub fn new(user_id: Uuid, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            name: name.into(),
            is_trial_active: false,
            has_used_trial: false,
            trial_start_date: None,
            trial_end_date: None,
            trial_last_notice: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            stripe_current_period_end: None,
            subscription_status: None,
            cancel_at_period_end: false,
            last_billing_event_at: None,
            version: 0,
        }
    }

    /// Paid access: a price is attached and the period (plus a day of grace)
    /// has not run out
    pub fn is_pro(&self, now: OffsetDateTime) -> bool {
        self.stripe_price_id.is_some()
            && self
                .stripe_current_period_end
                .is_some_and(|end| end + Duration::days(1) > now)
    }

    /// The trial flag is set and the end date has not passed
    pub fn trial_running(&self, now: OffsetDateTime) -> bool {
        self.is_trial_active && self.trial_end_date.is_none_or(|end| end > now)
    }

    /// A Stripe subscription is attached and still billing
    pub fn has_live_subscription(&self) -> bool {
        self.stripe_subscription_id.is_some()
            && self.subscription_status.is_some_and(|s| s.is_live())
    }

    fn is_stale(&self, event_at: OffsetDateTime) -> bool {
        self.last_billing_event_at.is_some_and(|last| event_at < last)
    }

    fn touch(&mut self, event_at: OffsetDateTime) {
        self.last_billing_event_at = Some(match self.last_billing_event_at {
            Some(last) if last > event_at => last,
            _ => event_at,
        });
    }
}

/// Where a user stands, derived from the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Free,
    Trialing,
    Active,
    CancelScheduled,
    PastDue,
    Expired,
}

impl LifecycleState {
    pub fn of(snapshot: &BillingSnapshot, now: OffsetDateTime) -> Self {
        let subscribed = snapshot.stripe_subscription_id.is_some();
        match snapshot.subscription_status {
            Some(SubscriptionStatus::Trialing) | Some(SubscriptionStatus::Active) if subscribed => {
                if snapshot.cancel_at_period_end {
                    LifecycleState::CancelScheduled
                } else if snapshot.subscription_status == Some(SubscriptionStatus::Trialing) {
                    LifecycleState::Trialing
                } else {
                    LifecycleState::Active
                }
            }
            Some(s) if s.is_delinquent() && subscribed => LifecycleState::PastDue,
            _ if snapshot.trial_running(now) => LifecycleState::Trialing,
            Some(s) if s.is_terminal() => LifecycleState::Expired,
            _ if snapshot.has_used_trial => LifecycleState::Expired,
            _ => LifecycleState::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Free => "free",
            LifecycleState::Trialing => "trialing",
            LifecycleState::Active => "active",
            LifecycleState::CancelScheduled => "cancel_scheduled",
            LifecycleState::PastDue => "past_due",
            LifecycleState::Expired => "expired",
        }
    }
}

/// An email a transition asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TrialStarted { trial_end: Option<OffsetDateTime> },
    TrialEnding { days_left: i64 },
    TrialLastDay,
    TrialEnded,
    SubscriptionCreated { plan_name: String },
    PlanChanged { plan_name: String },
    SubscriptionCancelled { access_until: Option<OffsetDateTime> },
    SubscriptionExpired,
    PaymentFailed,
    PaymentRetry { retry_at: OffsetDateTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Older than the last applied subscription event
    StaleEvent,
    /// About a subscription the user is not on
    ForeignSubscription,
    NotTrialing,
}

/// Outcome of folding one object into a snapshot
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub next: BillingSnapshot,
    pub history: Vec<HistoryEntry>,
    pub notifications: Vec<Notification>,
    pub skipped: Option<SkipReason>,
    changed: bool,
}

impl Reconciliation {
    fn finish(
        previous: &BillingSnapshot,
        next: BillingSnapshot,
        history: Vec<HistoryEntry>,
        notifications: Vec<Notification>,
    ) -> Self {
        Self {
            changed: next != *previous,
            next,
            history,
            notifications,
            skipped: None,
        }
    }

    fn skip(snapshot: &BillingSnapshot, reason: SkipReason) -> Self {
        Self {
            next: snapshot.clone(),
            history: Vec::new(),
            notifications: Vec::new(),
            skipped: Some(reason),
            changed: false,
        }
    }

    /// Whether the snapshot must be written back
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Nothing to persist, record or send
    pub fn is_noop(&self) -> bool {
        !self.changed && self.history.is_empty() && self.notifications.is_empty()
    }

    pub fn tag_event(&mut self, event_id: &str) {
        for entry in &mut self.history {
            entry.stripe_event_id = Some(event_id.to_string());
        }
    }
}

/// Applies Stripe objects to snapshots, labelling plans from the catalog
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    catalog: &'a PlanCatalog,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a PlanCatalog) -> Self {
        Self { catalog }
    }

    fn label(&self, price_id: Option<&str>) -> Option<String> {
        price_id.map(|id| self.catalog.label(id))
    }

    /// Fold a created/updated subscription into the snapshot
    pub fn apply_subscription(
        &self,
        snapshot: &BillingSnapshot,
        sub: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> Reconciliation {
        if sub.status.is_terminal() {
            return self.apply_subscription_deleted(snapshot, sub, event_at);
        }
        if snapshot.is_stale(event_at) {
            return Reconciliation::skip(snapshot, SkipReason::StaleEvent);
        }

        let is_current = snapshot.stripe_subscription_id.as_deref() == Some(sub.id.as_str());
        let previous_status = if is_current {
            snapshot.subscription_status
        } else {
            None
        };

        if previous_status.is_some_and(|s| s.is_live())
            && sub.status == SubscriptionStatus::Incomplete
        {
            return Reconciliation::skip(snapshot, SkipReason::StaleEvent);
        }

        let user_id = snapshot.user_id;
        let status = sub.status.as_str();
        let price_id = match sub.price_id() {
            Some(id) => Some(id.to_string()),
            None if is_current => snapshot.stripe_price_id.clone(),
            None => None,
        };
        let period_end = sub.period_end().and_then(from_unix);
        let new_plan = self.label(price_id.as_deref());
        let plan_name = self.catalog.title(price_id.as_deref());

        let mut next = snapshot.clone();
        let mut history = Vec::new();
        let mut notifications = Vec::new();
        let mut trial_started = false;

        use SubscriptionStatus as S;
        match (previous_status, sub.status) {
            (None | Some(S::Incomplete), S::Trialing) => {
                trial_started = true;
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::TrialStarted, status, event_at)
                        .plans(None, new_plan.clone()),
                );
            }
            (None | Some(S::Incomplete), S::Active) => {
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::Created, status, event_at)
                        .plans(None, new_plan.clone()),
                );
                notifications.push(Notification::SubscriptionCreated {
                    plan_name: plan_name.clone(),
                });
            }
            (None, new) if new.is_delinquent() => {
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::Created, status, event_at)
                        .plans(None, new_plan.clone()),
                );
            }
            (Some(S::Trialing), S::Active) => {
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::TrialConverted, status, event_at)
                        .plans(None, new_plan.clone()),
                );
                notifications.push(Notification::SubscriptionCreated {
                    plan_name: plan_name.clone(),
                });
            }
            (Some(old), new) if new.is_delinquent() && !old.is_delinquent() => {
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::PastDue, status, event_at)
                        .plans(None, new_plan.clone()),
                );
            }
            (Some(old), S::Active) if old.is_delinquent() => {
                history.push(
                    HistoryEntry::new(user_id, HistoryAction::Recovered, status, event_at)
                        .plans(None, new_plan.clone()),
                );
            }
            _ => {}
        }

        if is_current {
            let old_price = snapshot.stripe_price_id.as_deref();
            if let (Some(old), Some(new)) = (old_price, price_id.as_deref()) {
                if old != new {
                    history.push(
                        HistoryEntry::new(user_id, HistoryAction::PlanChanged, status, event_at)
                            .plans(self.label(Some(old)), new_plan.clone()),
                    );
                    notifications.push(Notification::PlanChanged {
                        plan_name: plan_name.clone(),
                    });
                }
            }

            match (snapshot.cancel_at_period_end, sub.cancel_at_period_end) {
                (false, true) => {
                    history.push(
                        HistoryEntry::new(user_id, HistoryAction::CancelScheduled, status, event_at)
                            .plans(new_plan.clone(), None),
                    );
                    notifications.push(Notification::SubscriptionCancelled {
                        access_until: period_end.or(snapshot.stripe_current_period_end),
                    });
                }
                (true, false) => {
                    history.push(
                        HistoryEntry::new(user_id, HistoryAction::Reactivated, status, event_at)
                            .plans(None, new_plan.clone()),
                    );
                }
                _ => {}
            }
        }

        next.stripe_subscription_id = Some(sub.id.clone());
        if let Some(customer) = &sub.customer {
            next.stripe_customer_id = Some(customer.clone());
        }
        next.stripe_price_id = price_id;
        if period_end.is_some() || !is_current {
            next.stripe_current_period_end = period_end;
        }
        next.subscription_status = Some(sub.status);
        next.cancel_at_period_end = sub.cancel_at_period_end;

        match sub.status {
            S::Trialing => {
                next.is_trial_active = true;
                next.has_used_trial = true;
                if let Some(start) = sub.trial_start.and_then(from_unix) {
                    next.trial_start_date = Some(start);
                } else if trial_started {
                    next.trial_start_date = Some(event_at);
                }
                if let Some(end) = sub.trial_end.and_then(from_unix) {
                    next.trial_end_date = Some(end);
                }
                if trial_started {
                    next.trial_last_notice = None;
                    notifications.push(Notification::TrialStarted {
                        trial_end: next.trial_end_date,
                    });
                }
            }
            S::Active | S::PastDue | S::Unpaid => next.is_trial_active = false,
            _ => {}
        }

        next.touch(event_at);
        Reconciliation::finish(snapshot, next, history, notifications)
    }

    /// Fold a subscription returned by an API call made for the user
    ///
    /// The response is current when it arrives but is not a Stripe event, so
    /// it is never stale and leaves `last_billing_event_at` untouched. Events
    /// Stripe stamps in the same second still apply afterwards.
    pub fn apply_api_response(
        &self,
        snapshot: &BillingSnapshot,
        sub: &SubscriptionObject,
        now: OffsetDateTime,
    ) -> Reconciliation {
        let unstamped = BillingSnapshot {
            last_billing_event_at: None,
            ..snapshot.clone()
        };
        let mut rec = self.apply_subscription(&unstamped, sub, now);
        rec.next.last_billing_event_at = snapshot.last_billing_event_at;
        rec.changed = rec.next != *snapshot;
        rec
    }

    /// The subscription ended for good
    pub fn apply_subscription_deleted(
        &self,
        snapshot: &BillingSnapshot,
        sub: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> Reconciliation {
        if snapshot.stripe_subscription_id.as_deref() != Some(sub.id.as_str()) {
            return Reconciliation::skip(snapshot, SkipReason::ForeignSubscription);
        }

        let was_paying = snapshot
            .subscription_status
            .is_none_or(|s| s != SubscriptionStatus::Incomplete);

        let mut next = snapshot.clone();
        next.stripe_subscription_id = None;
        next.stripe_price_id = None;
        next.subscription_status = Some(if sub.status.is_terminal() {
            sub.status
        } else {
            SubscriptionStatus::Canceled
        });
        next.cancel_at_period_end = false;
        next.is_trial_active = false;
        if let Some(end) = sub.ended_at.or(sub.period_end()).and_then(from_unix) {
            next.stripe_current_period_end = Some(end);
        }
        next.touch(event_at);

        let history = vec![HistoryEntry::new(
            snapshot.user_id,
            HistoryAction::Canceled,
            SubscriptionStatus::Canceled.as_str(),
            event_at,
        )
        .plans(self.label(snapshot.stripe_price_id.as_deref()), None)];

        let notifications = if was_paying {
            vec![Notification::SubscriptionExpired]
        } else {
            Vec::new()
        };

        Reconciliation::finish(snapshot, next, history, notifications)
    }

    /// Stripe's three-day trial reminder
    pub fn apply_trial_will_end(
        &self,
        snapshot: &BillingSnapshot,
        sub: &SubscriptionObject,
        now: OffsetDateTime,
    ) -> Reconciliation {
        if snapshot.stripe_subscription_id.as_deref() != Some(sub.id.as_str()) {
            return Reconciliation::skip(snapshot, SkipReason::ForeignSubscription);
        }
        if snapshot.trial_last_notice.is_some() {
            return Reconciliation::finish(snapshot, snapshot.clone(), Vec::new(), Vec::new());
        }

        let days = sub
            .trial_end
            .and_then(from_unix)
            .or(snapshot.trial_end_date)
            .map(|end| days_left(end, now))
            .unwrap_or(3);

        let mut next = snapshot.clone();
        next.trial_last_notice = Some(TrialNotice::Ending);

        Reconciliation::finish(
            snapshot,
            next,
            Vec::new(),
            vec![Notification::TrialEnding { days_left: days }],
        )
    }

    /// Is this invoice about a subscription other than the user's current one
    fn is_foreign(snapshot: &BillingSnapshot, invoice: &InvoiceObject) -> bool {
        match invoice.subscription_id() {
            Some(id) => snapshot.stripe_subscription_id.as_deref() != Some(id),
            None => false,
        }
    }

    pub fn apply_invoice_paid(
        &self,
        snapshot: &BillingSnapshot,
        invoice: &InvoiceObject,
        event_at: OffsetDateTime,
    ) -> Reconciliation {
        let mut next = snapshot.clone();
        let mut history = Vec::new();
        let plan = self.label(invoice.price_id().or(snapshot.stripe_price_id.as_deref()));

        if !Self::is_foreign(snapshot, invoice) {
            if let Some(end) = invoice.period_end().and_then(from_unix) {
                if snapshot.stripe_current_period_end.is_none_or(|current| end > current) {
                    next.stripe_current_period_end = Some(end);
                }
            }

            let delinquent = snapshot.subscription_status.is_some_and(|s| s.is_delinquent());
            if delinquent && !snapshot.is_stale(event_at) {
                next.subscription_status = Some(SubscriptionStatus::Active);
                history.push(
                    HistoryEntry::new(
                        snapshot.user_id,
                        HistoryAction::Recovered,
                        SubscriptionStatus::Active.as_str(),
                        event_at,
                    )
                    .plans(None, plan.clone()),
                );
            }
        }

        if invoice.amount_paid > 0 {
            history.push(
                HistoryEntry::new(snapshot.user_id, HistoryAction::PaymentSucceeded, "paid", event_at)
                    .plans(None, plan)
                    .amount(invoice.amount_paid, invoice.currency.as_deref())
                    .invoice(invoice.id.as_deref()),
            );
        }

        Reconciliation::finish(snapshot, next, history, Vec::new())
    }

    pub fn apply_invoice_failed(
        &self,
        snapshot: &BillingSnapshot,
        invoice: &InvoiceObject,
        event_at: OffsetDateTime,
    ) -> Reconciliation {
        let mut next = snapshot.clone();
        let mut notifications = Vec::new();
        let plan = self.label(invoice.price_id().or(snapshot.stripe_price_id.as_deref()));

        let history = vec![HistoryEntry::new(
            snapshot.user_id,
            HistoryAction::PaymentFailed,
            "failed",
            event_at,
        )
        .plans(None, plan)
        .amount(invoice.amount_due, invoice.currency.as_deref())];

        if !Self::is_foreign(snapshot, invoice) {
            let billing = matches!(
                snapshot.subscription_status,
                Some(SubscriptionStatus::Active) | Some(SubscriptionStatus::Trialing)
            );
            if billing && snapshot.stripe_subscription_id.is_some() && !snapshot.is_stale(event_at) {
                next.subscription_status = Some(SubscriptionStatus::PastDue);
            }

            notifications.push(match invoice.next_payment_attempt.and_then(from_unix) {
                Some(retry_at) => Notification::PaymentRetry { retry_at },
                None => Notification::PaymentFailed,
            });
        }

        Reconciliation::finish(snapshot, next, history, notifications)
    }

    /// Attach the customer created during checkout
    pub fn link_checkout(
        &self,
        snapshot: &BillingSnapshot,
        checkout: &CheckoutSessionObject,
    ) -> Reconciliation {
        let mut next = snapshot.clone();
        if let Some(customer) = &checkout.customer {
            next.stripe_customer_id = Some(customer.clone());
        }
        Reconciliation::finish(snapshot, next, Vec::new(), Vec::new())
    }

    /// Card-less trial for users that never had one
    pub fn start_local_trial(
        &self,
        snapshot: &BillingSnapshot,
        days: u32,
        now: OffsetDateTime,
    ) -> BillingResult<Reconciliation> {
        if days == 0 {
            return Err(BillingError::InvalidInput(
                "trial length must be at least one day".to_string(),
            ));
        }
        if snapshot.has_used_trial {
            return Err(BillingError::TrialAlreadyUsed);
        }
        if snapshot.has_live_subscription() {
            return Err(BillingError::AlreadySubscribed);
        }

        let trial_end = now + Duration::days(i64::from(days));
        let mut next = snapshot.clone();
        next.is_trial_active = true;
        next.has_used_trial = true;
        next.trial_start_date = Some(now);
        next.trial_end_date = Some(trial_end);
        next.trial_last_notice = None;

        let history = vec![HistoryEntry::new(
            snapshot.user_id,
            HistoryAction::TrialStarted,
            SubscriptionStatus::Trialing.as_str(),
            now,
        )];

        Ok(Reconciliation::finish(
            snapshot,
            next,
            history,
            vec![Notification::TrialStarted {
                trial_end: Some(trial_end),
            }],
        ))
    }

    /// Trial reminder or expiry due at `now`
    ///
    /// Reminders only escalate. Trials backed by a Stripe subscription are
    /// never expired here; the subscription webhook ends them.
    pub fn apply_trial_clock(&self, snapshot: &BillingSnapshot, now: OffsetDateTime) -> Reconciliation {
        let Some(trial_end) = snapshot.trial_end_date.filter(|_| snapshot.is_trial_active) else {
            return Reconciliation::skip(snapshot, SkipReason::NotTrialing);
        };

        let Some(due) = TrialNotice::due(trial_end, now) else {
            return Reconciliation::finish(snapshot, snapshot.clone(), Vec::new(), Vec::new());
        };
        if snapshot.trial_last_notice.is_some_and(|sent| sent >= due) {
            return Reconciliation::finish(snapshot, snapshot.clone(), Vec::new(), Vec::new());
        }

        let provider_backed = snapshot.has_live_subscription();
        let mut next = snapshot.clone();
        let mut history = Vec::new();
        let notification = match due {
            TrialNotice::Ending => Notification::TrialEnding {
                days_left: days_left(trial_end, now),
            },
            TrialNotice::LastDay => Notification::TrialLastDay,
            TrialNotice::Ended if provider_backed => {
                return Reconciliation::finish(snapshot, snapshot.clone(), Vec::new(), Vec::new());
            }
            TrialNotice::Ended => {
                next.is_trial_active = false;
                history.push(HistoryEntry::new(
                    snapshot.user_id,
                    HistoryAction::TrialExpired,
                    "expired",
                    now,
                ));
                Notification::TrialEnded
            }
        };
        next.trial_last_notice = Some(due);

        Reconciliation::finish(snapshot, next, history, vec![notification])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceIds;
    use serde_json::json;
    use time::macros::datetime;

    const USER: Uuid = Uuid::from_u128(0x0b5e_4f5a_6c1d_4d8e_9a43_3f8f_1c2a_7b10);
    const NOW: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn catalog() -> PlanCatalog {
        PlanCatalog::with_prices(&PriceIds {
            pro_monthly: "price_month".to_string(),
            pro_yearly: "price_year".to_string(),
        })
    }

    fn snapshot() -> BillingSnapshot {
        BillingSnapshot::new(USER, "jane@example.com", "Jane")
    }

    fn sub(status: &str, price: &str) -> SubscriptionObject {
        serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": status,
            "cancel_at_period_end": false,
            "current_period_end": (NOW + Duration::days(30)).unix_timestamp(),
            "trial_start": NOW.unix_timestamp(),
            "trial_end": (NOW + Duration::days(14)).unix_timestamp(),
            "items": { "data": [{ "id": "si_1", "price": { "id": price } }] }
        }))
        .unwrap()
    }

    fn subscribed(status: SubscriptionStatus) -> BillingSnapshot {
        BillingSnapshot {
            stripe_customer_id: Some("cus_1".to_string()),
            stripe_subscription_id: Some("sub_1".to_string()),
            stripe_price_id: Some("price_month".to_string()),
            stripe_current_period_end: Some(NOW + Duration::days(10)),
            subscription_status: Some(status),
            last_billing_event_at: Some(NOW - Duration::hours(1)),
            ..snapshot()
        }
    }

    fn actions(rec: &Reconciliation) -> Vec<HistoryAction> {
        rec.history.iter().map(|h| h.action).collect()
    }

    #[test]
    fn test_new_trialing_subscription_starts_trial() {
        let catalog = catalog();
        let rec = Reconciler::new(&catalog).apply_subscription(&snapshot(), &sub("trialing", "price_month"), NOW);

        assert!(rec.changed());
        assert!(rec.next.is_trial_active);
        assert!(rec.next.has_used_trial);
        assert_eq!(rec.next.trial_start_date, Some(NOW));
        assert_eq!(rec.next.trial_end_date, Some(NOW + Duration::days(14)));
        assert_eq!(rec.next.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(actions(&rec), vec![HistoryAction::TrialStarted]);
        assert_eq!(rec.history[0].new_plan.as_deref(), Some("Pro (monthly)"));
        assert!(matches!(rec.notifications[..], [Notification::TrialStarted { .. }]));
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::Trialing);
    }

    #[test]
    fn test_new_active_subscription_is_created() {
        let catalog = catalog();
        let rec = Reconciler::new(&catalog).apply_subscription(&snapshot(), &sub("active", "price_year"), NOW);

        assert_eq!(actions(&rec), vec![HistoryAction::Created]);
        assert_eq!(
            rec.notifications,
            vec![Notification::SubscriptionCreated {
                plan_name: "Pro".to_string()
            }]
        );
        assert_eq!(rec.next.stripe_price_id.as_deref(), Some("price_year"));
        assert!(rec.next.is_pro(NOW));
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::Active);
    }

    #[test]
    fn test_trial_conversion() {
        let catalog = catalog();
        let mut before = subscribed(SubscriptionStatus::Trialing);
        before.is_trial_active = true;
        before.has_used_trial = true;

        let rec = Reconciler::new(&catalog).apply_subscription(&before, &sub("active", "price_month"), NOW);
        assert!(!rec.next.is_trial_active);
        assert!(rec.next.has_used_trial);
        assert_eq!(actions(&rec), vec![HistoryAction::TrialConverted]);
        assert!(matches!(
            rec.notifications[..],
            [Notification::SubscriptionCreated { .. }]
        ));
    }

    #[test]
    fn test_plan_change_records_old_and_new() {
        let catalog = catalog();
        let before = subscribed(SubscriptionStatus::Active);
        let rec = Reconciler::new(&catalog).apply_subscription(&before, &sub("active", "price_year"), NOW);

        assert_eq!(actions(&rec), vec![HistoryAction::PlanChanged]);
        assert_eq!(rec.history[0].old_plan.as_deref(), Some("Pro (monthly)"));
        assert_eq!(rec.history[0].new_plan.as_deref(), Some("Pro (yearly)"));
        assert_eq!(rec.next.stripe_price_id.as_deref(), Some("price_year"));
    }

    #[test]
    fn test_cancel_then_reactivate() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);
        let before = subscribed(SubscriptionStatus::Active);

        let mut canceling = sub("active", "price_month");
        canceling.cancel_at_period_end = true;
        let rec = reconciler.apply_subscription(&before, &canceling, NOW);
        assert_eq!(actions(&rec), vec![HistoryAction::CancelScheduled]);
        assert_eq!(
            rec.notifications,
            vec![Notification::SubscriptionCancelled {
                access_until: Some(NOW + Duration::days(30))
            }]
        );
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::CancelScheduled);

        let rec = reconciler.apply_subscription(&rec.next, &sub("active", "price_month"), NOW + Duration::minutes(1));
        assert_eq!(actions(&rec), vec![HistoryAction::Reactivated]);
        assert!(rec.notifications.is_empty());
        assert!(!rec.next.cancel_at_period_end);
    }

    #[test]
    fn test_past_due_and_recovery() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);

        let rec = reconciler.apply_subscription(
            &subscribed(SubscriptionStatus::Active),
            &sub("past_due", "price_month"),
            NOW,
        );
        assert_eq!(actions(&rec), vec![HistoryAction::PastDue]);
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::PastDue);

        let rec = reconciler.apply_subscription(&rec.next, &sub("active", "price_month"), NOW);
        assert_eq!(actions(&rec), vec![HistoryAction::Recovered]);
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::Active);
    }

    #[test]
    fn test_stale_event_is_skipped() {
        let catalog = catalog();
        let before = subscribed(SubscriptionStatus::Active);
        let rec = Reconciler::new(&catalog).apply_subscription(
            &before,
            &sub("past_due", "price_month"),
            NOW - Duration::hours(2),
        );
        assert_eq!(rec.skipped, Some(SkipReason::StaleEvent));
        assert!(rec.is_noop());
        assert_eq!(rec.next, before);
    }

    #[test]
    fn test_api_response_keeps_event_watermark() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);
        let before = subscribed(SubscriptionStatus::Active);
        let mut canceled = sub("active", "price_month");
        canceled.cancel_at_period_end = true;

        // Server clock ahead of Stripe's
        let rec = reconciler.apply_api_response(&before, &canceled, NOW + Duration::minutes(5));
        assert!(rec.changed());
        assert!(rec.next.cancel_at_period_end);
        assert_eq!(actions(&rec), vec![HistoryAction::CancelScheduled]);
        assert_eq!(rec.next.last_billing_event_at, before.last_billing_event_at);

        // A portal reactivation stamped before the server clock still applies
        let reactivated = reconciler.apply_subscription(&rec.next, &sub("active", "price_month"), NOW);
        assert_eq!(reactivated.skipped, None);
        assert!(!reactivated.next.cancel_at_period_end);
        assert_eq!(actions(&reactivated), vec![HistoryAction::Reactivated]);
    }

    #[test]
    fn test_live_subscription_never_regresses_to_incomplete() {
        let catalog = catalog();
        let before = subscribed(SubscriptionStatus::Active);
        let rec = Reconciler::new(&catalog).apply_subscription(&before, &sub("incomplete", "price_month"), NOW);
        assert_eq!(rec.skipped, Some(SkipReason::StaleEvent));
        assert_eq!(rec.next.subscription_status, Some(SubscriptionStatus::Active));
    }

    #[test]
    fn test_replaying_same_state_changes_nothing() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);
        let first = reconciler.apply_subscription(&snapshot(), &sub("active", "price_month"), NOW);
        let again = reconciler.apply_subscription(&first.next, &sub("active", "price_month"), NOW);
        assert!(again.is_noop());
    }

    #[test]
    fn test_deletion_clears_subscription_but_keeps_customer() {
        let catalog = catalog();
        let rec = Reconciler::new(&catalog).apply_subscription_deleted(
            &subscribed(SubscriptionStatus::Active),
            &sub("canceled", "price_month"),
            NOW,
        );

        assert_eq!(rec.next.stripe_subscription_id, None);
        assert_eq!(rec.next.stripe_price_id, None);
        assert_eq!(rec.next.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(rec.next.subscription_status, Some(SubscriptionStatus::Canceled));
        assert!(!rec.next.is_pro(NOW));
        assert_eq!(actions(&rec), vec![HistoryAction::Canceled]);
        assert_eq!(rec.history[0].old_plan.as_deref(), Some("Pro (monthly)"));
        assert_eq!(rec.notifications, vec![Notification::SubscriptionExpired]);
        assert_eq!(LifecycleState::of(&rec.next, NOW), LifecycleState::Expired);
    }

    #[test]
    fn test_canceled_status_update_is_handled_as_deletion() {
        let catalog = catalog();
        let rec = Reconciler::new(&catalog).apply_subscription(
            &subscribed(SubscriptionStatus::Active),
            &sub("canceled", "price_month"),
            NOW,
        );
        assert_eq!(actions(&rec), vec![HistoryAction::Canceled]);
    }

    #[test]
    fn test_deletion_of_other_subscription_is_ignored() {
        let catalog = catalog();
        let mut other = sub("canceled", "price_month");
        other.id = "sub_old".to_string();
        let rec = Reconciler::new(&catalog).apply_subscription_deleted(
            &subscribed(SubscriptionStatus::Active),
            &other,
            NOW,
        );
        assert_eq!(rec.skipped, Some(SkipReason::ForeignSubscription));
        assert!(rec.is_noop());
    }

    #[test]
    fn test_trial_will_end_notifies_once() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);
        let mut before = subscribed(SubscriptionStatus::Trialing);
        before.is_trial_active = true;

        let mut trialing = sub("trialing", "price_month");
        trialing.trial_end = Some((NOW + Duration::hours(50)).unix_timestamp());
        let rec = reconciler.apply_trial_will_end(&before, &trialing, NOW);
        assert_eq!(rec.notifications, vec![Notification::TrialEnding { days_left: 3 }]);
        assert_eq!(rec.next.trial_last_notice, Some(TrialNotice::Ending));

        let again = reconciler.apply_trial_will_end(&rec.next, &trialing, NOW);
        assert!(again.is_noop());
    }

    #[test]
    fn test_invoice_paid_extends_period_and_records_amount() {
        let catalog = catalog();
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "id": "in_1",
            "subscription": "sub_1",
            "amount_paid": 999,
            "currency": "usd",
            "lines": { "data": [{ "period": { "end": (NOW + Duration::days(40)).unix_timestamp() } }] }
        }))
        .unwrap();

        let rec = Reconciler::new(&catalog).apply_invoice_paid(
            &subscribed(SubscriptionStatus::PastDue),
            &invoice,
            NOW,
        );
        assert_eq!(rec.next.stripe_current_period_end, Some(NOW + Duration::days(40)));
        assert_eq!(rec.next.subscription_status, Some(SubscriptionStatus::Active));
        assert_eq!(
            actions(&rec),
            vec![HistoryAction::Recovered, HistoryAction::PaymentSucceeded]
        );
        let payment = &rec.history[1];
        assert_eq!(payment.amount.as_deref(), Some("9.99"));
        assert_eq!(payment.currency.as_deref(), Some("USD"));
        assert_eq!(payment.stripe_invoice_id.as_deref(), Some("in_1"));
    }

    #[test]
    fn test_invoice_never_shortens_period() {
        let catalog = catalog();
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "subscription": "sub_1",
            "amount_paid": 0,
            "lines": { "data": [{ "period": { "end": (NOW + Duration::days(1)).unix_timestamp() } }] }
        }))
        .unwrap();

        let before = subscribed(SubscriptionStatus::Active);
        let rec = Reconciler::new(&catalog).apply_invoice_paid(&before, &invoice, NOW);
        assert!(rec.is_noop());
    }

    #[test]
    fn test_invoice_failed_with_retry() {
        let catalog = catalog();
        let retry_at = NOW + Duration::days(3);
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "subscription": "sub_1",
            "amount_due": 999,
            "currency": "eur",
            "next_payment_attempt": retry_at.unix_timestamp()
        }))
        .unwrap();

        let rec = Reconciler::new(&catalog).apply_invoice_failed(
            &subscribed(SubscriptionStatus::Active),
            &invoice,
            NOW,
        );
        assert_eq!(rec.next.subscription_status, Some(SubscriptionStatus::PastDue));
        assert_eq!(actions(&rec), vec![HistoryAction::PaymentFailed]);
        assert_eq!(rec.notifications, vec![Notification::PaymentRetry { retry_at }]);
    }

    #[test]
    fn test_invoice_failed_final_attempt() {
        let catalog = catalog();
        let invoice: InvoiceObject =
            serde_json::from_value(json!({ "subscription": "sub_1", "amount_due": 999 })).unwrap();
        let rec = Reconciler::new(&catalog).apply_invoice_failed(
            &subscribed(SubscriptionStatus::PastDue),
            &invoice,
            NOW,
        );
        assert_eq!(rec.notifications, vec![Notification::PaymentFailed]);
    }

    #[test]
    fn test_invoice_for_unlinked_subscription_only_records_history() {
        let catalog = catalog();
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "subscription": "sub_new",
            "amount_due": 999,
            "next_payment_attempt": NOW.unix_timestamp()
        }))
        .unwrap();
        let before = subscribed(SubscriptionStatus::Active);
        let rec = Reconciler::new(&catalog).apply_invoice_failed(&before, &invoice, NOW);
        assert!(!rec.changed());
        assert!(rec.notifications.is_empty());
        assert_eq!(actions(&rec), vec![HistoryAction::PaymentFailed]);
    }

    #[test]
    fn test_link_checkout_attaches_customer() {
        let catalog = catalog();
        let checkout: CheckoutSessionObject = serde_json::from_value(json!({
            "id": "cs_1",
            "mode": "subscription",
            "customer": "cus_9"
        }))
        .unwrap();
        let rec = Reconciler::new(&catalog).link_checkout(&snapshot(), &checkout);
        assert!(rec.changed());
        assert_eq!(rec.next.stripe_customer_id.as_deref(), Some("cus_9"));
    }

    #[test]
    fn test_local_trial_rules() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);

        let rec = reconciler.start_local_trial(&snapshot(), 14, NOW).unwrap();
        assert!(rec.next.is_trial_active);
        assert_eq!(rec.next.trial_end_date, Some(NOW + Duration::days(14)));
        assert_eq!(actions(&rec), vec![HistoryAction::TrialStarted]);

        assert!(matches!(
            reconciler.start_local_trial(&rec.next, 14, NOW),
            Err(BillingError::TrialAlreadyUsed)
        ));
        assert!(matches!(
            reconciler.start_local_trial(&subscribed(SubscriptionStatus::Active), 14, NOW),
            Err(BillingError::AlreadySubscribed)
        ));
        assert!(matches!(
            reconciler.start_local_trial(&snapshot(), 0, NOW),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_trial_notice_thresholds() {
        assert_eq!(TrialNotice::due(NOW + Duration::days(5), NOW), None);
        assert_eq!(TrialNotice::due(NOW + Duration::days(3), NOW), Some(TrialNotice::Ending));
        assert_eq!(TrialNotice::due(NOW + Duration::hours(23), NOW), Some(TrialNotice::LastDay));
        assert_eq!(TrialNotice::due(NOW, NOW), Some(TrialNotice::Ended));
        assert_eq!(days_left(NOW + Duration::hours(49), NOW), 3);
        assert_eq!(days_left(NOW + Duration::hours(48), NOW), 2);
        assert_eq!(days_left(NOW + Duration::minutes(5), NOW), 1);
    }

    #[test]
    fn test_trial_clock_escalates_and_expires() {
        let catalog = catalog();
        let reconciler = Reconciler::new(&catalog);
        let trial = reconciler.start_local_trial(&snapshot(), 14, NOW).unwrap().next;

        let early = reconciler.apply_trial_clock(&trial, NOW + Duration::days(2));
        assert!(early.is_noop());

        let ending = reconciler.apply_trial_clock(&trial, NOW + Duration::days(12));
        assert_eq!(ending.notifications, vec![Notification::TrialEnding { days_left: 2 }]);

        let repeat = reconciler.apply_trial_clock(&ending.next, NOW + Duration::days(12) + Duration::hours(1));
        assert!(repeat.is_noop());

        let last_day = reconciler.apply_trial_clock(&ending.next, NOW + Duration::days(13) + Duration::hours(2));
        assert_eq!(last_day.notifications, vec![Notification::TrialLastDay]);

        let ended = reconciler.apply_trial_clock(&last_day.next, NOW + Duration::days(15));
        assert_eq!(ended.notifications, vec![Notification::TrialEnded]);
        assert!(!ended.next.is_trial_active);
        assert_eq!(actions(&ended), vec![HistoryAction::TrialExpired]);
        assert_eq!(LifecycleState::of(&ended.next, NOW + Duration::days(15)), LifecycleState::Expired);
    }

    #[test]
    fn test_trial_clock_leaves_provider_trials_to_webhooks() {
        let catalog = catalog();
        let mut before = subscribed(SubscriptionStatus::Trialing);
        before.is_trial_active = true;
        before.trial_end_date = Some(NOW - Duration::hours(1));

        let rec = Reconciler::new(&catalog).apply_trial_clock(&before, NOW);
        assert!(rec.is_noop());
        assert!(rec.next.is_trial_active);
    }

    #[test]
    fn test_is_pro_grace_day() {
        let mut s = subscribed(SubscriptionStatus::Active);
        s.stripe_current_period_end = Some(NOW - Duration::hours(20));
        assert!(s.is_pro(NOW));
        s.stripe_current_period_end = Some(NOW - Duration::hours(25));
        assert!(!s.is_pro(NOW));
        s.stripe_current_period_end = Some(NOW + Duration::days(1));
        s.stripe_price_id = None;
        assert!(!s.is_pro(NOW));
    }

    #[test]
    fn test_free_state() {
        assert_eq!(LifecycleState::of(&snapshot(), NOW), LifecycleState::Free);
    }
}
