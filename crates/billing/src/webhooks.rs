//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, claims the event in the
//! idempotency ledger, resolves the affected user and folds the event into
//! their billing snapshot.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingNotifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_event, BillingEvent, ProviderEvent};
use crate::lifecycle::{from_unix, BillingSnapshot, Reconciler, Reconciliation};
use crate::plans::PlanCatalog;
use crate::provider::PaymentProvider;
use crate::store::{self, BillingStore, EventClaim};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

fn hmac_hex(secret: &str, timestamp: i64, payload: &str) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header
///
/// Any `v1` entry may match; other schemes are ignored.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = hmac_hex(secret, timestamp, payload)?;
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate).is_ok_and(|bytes| bool::from(bytes.ct_eq(&expected)))
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Build a signature header the way Stripe does
///
/// Used to drive the endpoint in tests and from local tooling.
pub fn signature_header(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let signature = hex::encode(hmac_hex(secret, timestamp, payload)?);
    Ok(format!("t={timestamp},v1={signature}"))
}

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already processed or being processed elsewhere
    Duplicate,
    /// Acknowledged without state changes
    Ignored,
}

pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: BillingNotifier,
    catalog: Arc<PlanCatalog>,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: BillingNotifier,
        catalog: Arc<PlanCatalog>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            catalog,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify and parse a delivery
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<ProviderEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;
        let event = parse_event(payload).inspect_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook event JSON");
        })?;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Webhook signature verified");
        Ok(event)
    }

    /// Verify, claim and process one delivery
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Process a verified event exactly once
    ///
    /// A failed event is recorded as `error` and may be claimed again on
    /// Stripe's next delivery attempt.
    pub async fn handle_event(&self, event: ProviderEvent) -> BillingResult<WebhookOutcome> {
        let event_at = from_unix(event.created).unwrap_or_else(OffsetDateTime::now_utc);

        let claim = self
            .store
            .claim_event(&event.id, &event.event_type, event_at)
            .await
            .inspect_err(|e| {
                tracing::error!(event_id = %event.id, error = %e, "Failed to claim webhook event for processing");
            })?;

        if let EventClaim::Duplicate { status } = claim {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                status = ?status,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Processing Stripe webhook event");

        let result = self.process(&event, event_at).await;

        let error = result.as_ref().err().map(ToString::to_string);
        if let Err(e) = self.store.finish_event(&event.id, error.as_deref()).await {
            tracing::error!(event_id = %event.id, error = %e, "Failed to record webhook processing result");
        }

        match &result {
            Ok(outcome) => tracing::info!(event_id = %event.id, outcome = ?outcome, "Webhook event handled"),
            Err(e) => tracing::error!(event_id = %event.id, error = %e, retryable = e.is_retryable(), "Webhook event failed"),
        }
        result
    }

    async fn process(&self, event: &ProviderEvent, event_at: OffsetDateTime) -> BillingResult<WebhookOutcome> {
        let reconciler = Reconciler::new(&self.catalog);

        match &event.payload {
            BillingEvent::CheckoutCompleted(session) => {
                if !session.is_subscription() {
                    tracing::info!(session_id = %session.id, mode = ?session.mode, "Ignoring non-subscription checkout");
                    return Ok(WebhookOutcome::Ignored);
                }
                let Some(snapshot) = self
                    .resolve(
                        session.user_id_hint(),
                        session.customer.as_deref(),
                        session.subscription.as_deref(),
                    )
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };

                let linked = self
                    .apply(snapshot, &event.id, |s| reconciler.link_checkout(s, session))
                    .await?;

                if let Some(subscription_id) = &session.subscription {
                    let subscription = self.provider.retrieve_subscription(subscription_id).await?;
                    self.apply(linked.next, &event.id, |s| {
                        reconciler.apply_subscription(s, &subscription, event_at)
                    })
                    .await?;
                }
                Ok(WebhookOutcome::Processed)
            }

            BillingEvent::SubscriptionCreated(sub) | BillingEvent::SubscriptionUpdated(sub) => {
                let Some(snapshot) = self
                    .resolve(sub.user_id_hint(), sub.customer.as_deref(), Some(&sub.id))
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };
                let rec = self
                    .apply(snapshot, &event.id, |s| reconciler.apply_subscription(s, sub, event_at))
                    .await?;
                Ok(self.outcome(&rec, &event.id))
            }

            BillingEvent::SubscriptionDeleted(sub) => {
                let Some(snapshot) = self
                    .resolve(sub.user_id_hint(), sub.customer.as_deref(), Some(&sub.id))
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };
                let rec = self
                    .apply(snapshot, &event.id, |s| {
                        reconciler.apply_subscription_deleted(s, sub, event_at)
                    })
                    .await?;
                Ok(self.outcome(&rec, &event.id))
            }

            BillingEvent::TrialWillEnd(sub) => {
                let Some(snapshot) = self
                    .resolve(sub.user_id_hint(), sub.customer.as_deref(), Some(&sub.id))
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };
                let now = OffsetDateTime::now_utc();
                let rec = self
                    .apply(snapshot, &event.id, |s| reconciler.apply_trial_will_end(s, sub, now))
                    .await?;
                Ok(self.outcome(&rec, &event.id))
            }

            BillingEvent::InvoicePaid(invoice) => {
                let Some(snapshot) = self
                    .resolve(None, invoice.customer.as_deref(), invoice.subscription_id())
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };
                let rec = self
                    .apply(snapshot, &event.id, |s| reconciler.apply_invoice_paid(s, invoice, event_at))
                    .await?;
                Ok(self.outcome(&rec, &event.id))
            }

            BillingEvent::InvoicePaymentFailed(invoice) => {
                let Some(snapshot) = self
                    .resolve(None, invoice.customer.as_deref(), invoice.subscription_id())
                    .await?
                else {
                    return Ok(self.unknown_user(event));
                };
                let rec = self
                    .apply(snapshot, &event.id, |s| reconciler.apply_invoice_failed(s, invoice, event_at))
                    .await?;
                Ok(self.outcome(&rec, &event.id))
            }

            BillingEvent::Unhandled => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Find the user an event is about: metadata, then customer, then subscription
    async fn resolve(
        &self,
        user_id: Option<Uuid>,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<BillingSnapshot>> {
        if let Some(id) = user_id {
            if let Some(snapshot) = self.store.snapshot(id).await? {
                return Ok(Some(snapshot));
            }
        }
        if let Some(customer) = customer_id {
            if let Some(snapshot) = self.store.snapshot_by_customer(customer).await? {
                return Ok(Some(snapshot));
            }
        }
        if let Some(subscription) = subscription_id {
            return self.store.snapshot_by_subscription(subscription).await;
        }
        Ok(None)
    }

    fn unknown_user(&self, event: &ProviderEvent) -> WebhookOutcome {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook event does not match any user - acknowledging without changes"
        );
        WebhookOutcome::Ignored
    }

    /// Fold the event into the user's state, retrying on concurrent writes
    async fn apply<F>(
        &self,
        snapshot: BillingSnapshot,
        event_id: &str,
        fold: F,
    ) -> BillingResult<Reconciliation>
    where
        F: Fn(&BillingSnapshot) -> Reconciliation + Send + Sync,
    {
        store::reconcile(self.store.as_ref(), &self.notifier, snapshot, |s| {
            let mut rec = fold(s);
            rec.tag_event(event_id);
            Ok(rec)
        })
        .await
    }

    fn outcome(&self, rec: &Reconciliation, event_id: &str) -> WebhookOutcome {
        if let Some(reason) = rec.skipped {
            tracing::info!(event_id = %event_id, user_id = %rec.next.user_id, reason = ?reason, "Webhook event skipped");
            return WebhookOutcome::Ignored;
        }
        tracing::info!(
            event_id = %event_id,
            user_id = %rec.next.user_id,
            history = rec.history.len(),
            notifications = rec.notifications.len(),
            "Billing state reconciled"
        );
        WebhookOutcome::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"customer.created","created":1700000000,"data":{"object":{}}}"#;
    const NOW: i64 = 1_700_000_100;

    #[test]
    fn test_valid_signature() {
        let header = signature_header(PAYLOAD, SECRET, NOW).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let good = signature_header(PAYLOAD, SECRET, NOW).unwrap();
        let sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1={},v0=abc,v1={sig}", "00".repeat(32));
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = signature_header(PAYLOAD, SECRET, NOW).unwrap();
        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        assert!(matches!(
            verify_signature(&tampered, &header, SECRET, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = signature_header(PAYLOAD, "whsec_other", NOW).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn test_timestamp_tolerance() {
        let header = signature_header(PAYLOAD, SECRET, NOW).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW + 300).is_ok());
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW + 301).is_err());
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW - 301).is_err());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let headers = vec![
            String::new(),
            "v1=deadbeef".to_string(),
            format!("t={NOW}"),
            format!("t=abc,v1={}", "00".repeat(32)),
            format!("t={NOW},v1=not-hex"),
        ];
        for header in &headers {
            assert!(
                matches!(
                    verify_signature(PAYLOAD, header, SECRET, NOW),
                    Err(BillingError::WebhookSignatureInvalid)
                ),
                "header {header:?} should be rejected"
            );
        }
    }
}
