//! Stripe webhook events
//!
//! Only the fields the lifecycle needs are modelled. Stripe moves fields
//! between API versions (period dates moved from the subscription onto its
//! items, invoice subscriptions moved under `parent`), so both locations are
//! accepted.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Accept an expandable field as either `"id"` or `{ "id": ... }`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

/// Stripe metadata values are strings, but be lenient about what was stored
fn lenient_metadata<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<HashMap<String, Value>>::deserialize(deserializer)?;
    Ok(value
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Null => None,
            other => Some((k, other.to_string())),
        })
        .collect())
}

fn metadata_user_id(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("userId")
        .or_else(|| metadata.get("user_id"))
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Unknown,
        }
    }

    /// The subscription will never bill again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }

    /// Payment is overdue but Stripe has not given up
    pub fn is_delinquent(&self) -> bool {
        matches!(self, SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid)
    }

    /// The subscription currently grants (or is about to grant) access
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Unpaid
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ItemList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceObject {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub items: ItemList<SubscriptionItem>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    pub fn item_id(&self) -> Option<&str> {
        self.items.data.first().and_then(|item| item.id.as_deref())
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|item| item.current_period_end))
    }

    pub fn user_id_hint(&self) -> Option<Uuid> {
        metadata_user_id(&self.metadata)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinePeriod {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<LinePeriod>,
    #[serde(default)]
    pub price: Option<PriceObject>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<u32>,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub lines: ItemList<InvoiceLine>,
}

impl InvoiceObject {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    /// Latest period end across invoice lines
    pub fn period_end(&self) -> Option<i64> {
        self.lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref().and_then(|p| p.end))
            .max()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .data
            .iter()
            .find_map(|line| line.price.as_ref().map(|p| p.id.as_str()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn is_subscription(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }

    pub fn user_id_hint(&self) -> Option<Uuid> {
        metadata_user_id(&self.metadata).or_else(|| {
            self.client_reference_id
                .as_deref()
                .and_then(|id| Uuid::parse_str(id).ok())
        })
    }
}

/// Billing-relevant content of a webhook event
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    TrialWillEnd(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unhandled,
}

#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    /// Unix seconds when Stripe created the event
    pub created: i64,
    pub payload: BillingEvent,
}

#[derive(Deserialize)]
struct RawEventData {
    object: Value,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

fn object<T: serde::de::DeserializeOwned>(event_type: &str, value: Value) -> BillingResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("{event_type}: {e}")))
}

/// Parse a verified webhook body
pub fn parse_event(payload: &str) -> BillingResult<ProviderEvent> {
    let raw: RawEvent = serde_json::from_str(payload)
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

    let kind = raw.event_type.as_str();
    let data = raw.data.object;
    let payload = match kind {
        "checkout.session.completed" => BillingEvent::CheckoutCompleted(object(kind, data)?),
        "customer.subscription.created" => BillingEvent::SubscriptionCreated(object(kind, data)?),
        "customer.subscription.updated" => BillingEvent::SubscriptionUpdated(object(kind, data)?),
        "customer.subscription.deleted" => BillingEvent::SubscriptionDeleted(object(kind, data)?),
        "customer.subscription.trial_will_end" => BillingEvent::TrialWillEnd(object(kind, data)?),
        "invoice.paid" | "invoice.payment_succeeded" => {
            BillingEvent::InvoicePaid(object(kind, data)?)
        }
        "invoice.payment_failed" => BillingEvent::InvoicePaymentFailed(object(kind, data)?),
        _ => BillingEvent::Unhandled,
    };

    Ok(ProviderEvent {
        id: raw.id,
        event_type: raw.event_type,
        created: raw.created,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, object: Value) -> String {
        json!({
            "id": "evt_1",
            "type": kind,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
        .to_string()
    }

    #[test]
    fn test_subscription_period_from_items() {
        let payload = event(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": { "id": "cus_1", "object": "customer" },
                "status": "active",
                "items": { "data": [{
                    "id": "si_1",
                    "price": { "id": "price_month", "unit_amount": 999, "currency": "usd" },
                    "current_period_end": 1_702_592_000
                }]},
                "metadata": { "userId": "0b5e4f5a-6c1d-4d8e-9a43-3f8f1c2a7b10" }
            }),
        );

        let event = parse_event(&payload).unwrap();
        let BillingEvent::SubscriptionUpdated(sub) = event.payload else {
            panic!("expected subscription update");
        };
        assert_eq!(sub.customer.as_deref(), Some("cus_1"));
        assert_eq!(sub.price_id(), Some("price_month"));
        assert_eq!(sub.item_id(), Some("si_1"));
        assert_eq!(sub.period_end(), Some(1_702_592_000));
        assert!(sub.user_id_hint().is_some());
    }

    #[test]
    fn test_top_level_period_wins() {
        let sub: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "trialing",
            "current_period_end": 100,
            "items": { "data": [{ "current_period_end": 200 }] }
        }))
        .unwrap();
        assert_eq!(sub.period_end(), Some(100));
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let sub: SubscriptionObject =
            serde_json::from_value(json!({ "id": "sub_1", "status": "something_new" })).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Unknown);
        assert!(!sub.status.is_live());
    }

    #[test]
    fn test_invoice_subscription_under_parent() {
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "id": "in_1",
            "customer": "cus_1",
            "parent": { "subscription_details": { "subscription": "sub_9" } },
            "amount_paid": 999,
            "currency": "usd",
            "lines": { "data": [
                { "period": { "start": 1, "end": 50 } },
                { "period": { "start": 1, "end": 80 }, "price": { "id": "price_year" } }
            ]}
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id(), Some("sub_9"));
        assert_eq!(invoice.period_end(), Some(80));
        assert_eq!(invoice.price_id(), Some("price_year"));
    }

    #[test]
    fn test_checkout_user_from_client_reference() {
        let session: CheckoutSessionObject = serde_json::from_value(json!({
            "id": "cs_1",
            "mode": "subscription",
            "customer": null,
            "client_reference_id": "0b5e4f5a-6c1d-4d8e-9a43-3f8f1c2a7b10",
            "metadata": {}
        }))
        .unwrap();
        assert!(session.is_subscription());
        assert_eq!(session.customer, None);
        assert!(session.user_id_hint().is_some());
    }

    #[test]
    fn test_invoice_payment_succeeded_alias() {
        let payload = event("invoice.payment_succeeded", json!({ "id": "in_1" }));
        let event = parse_event(&payload).unwrap();
        assert!(matches!(event.payload, BillingEvent::InvoicePaid(_)));
    }

    #[test]
    fn test_unhandled_event_types() {
        let payload = event("customer.created", json!({ "id": "cus_1" }));
        let event = parse_event(&payload).unwrap();
        assert!(matches!(event.payload, BillingEvent::Unhandled));
        assert_eq!(event.event_type, "customer.created");
    }

    #[test]
    fn test_malformed_handled_object_is_rejected() {
        let payload = event("customer.subscription.updated", json!({ "status": "active" }));
        assert!(matches!(
            parse_event(&payload),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        assert!(matches!(
            parse_event("not json"),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
    }
}
