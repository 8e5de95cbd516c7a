//! Subscription history entries

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    TrialStarted,
    TrialConverted,
    TrialExpired,
    Created,
    PlanChanged,
    CancelScheduled,
    Reactivated,
    PastDue,
    Recovered,
    Canceled,
    PaymentSucceeded,
    PaymentFailed,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::TrialStarted => "trial_started",
            HistoryAction::TrialConverted => "trial_converted",
            HistoryAction::TrialExpired => "trial_expired",
            HistoryAction::Created => "created",
            HistoryAction::PlanChanged => "plan_changed",
            HistoryAction::CancelScheduled => "cancel_scheduled",
            HistoryAction::Reactivated => "reactivated",
            HistoryAction::PastDue => "past_due",
            HistoryAction::Recovered => "recovered",
            HistoryAction::Canceled => "canceled",
            HistoryAction::PaymentSucceeded => "payment_succeeded",
            HistoryAction::PaymentFailed => "payment_failed",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A history row about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub user_id: Uuid,
    pub action: HistoryAction,
    pub old_plan: Option<String>,
    pub new_plan: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub status: String,
    pub stripe_event_id: Option<String>,
    /// Set on payment rows; one row per invoice and action
    pub stripe_invoice_id: Option<String>,
    pub timestamp: OffsetDateTime,
}

impl HistoryEntry {
    pub fn new(
        user_id: Uuid,
        action: HistoryAction,
        status: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            user_id,
            action,
            old_plan: None,
            new_plan: None,
            amount: None,
            currency: None,
            status: status.into(),
            stripe_event_id: None,
            stripe_invoice_id: None,
            timestamp,
        }
    }

    pub fn plans(mut self, old_plan: Option<String>, new_plan: Option<String>) -> Self {
        self.old_plan = old_plan;
        self.new_plan = new_plan;
        self
    }

    /// Attach an amount given in the currency's minor unit
    pub fn amount(mut self, minor_units: i64, currency: Option<&str>) -> Self {
        self.amount = Some(format_minor_units(minor_units));
        self.currency = currency.map(str::to_uppercase);
        self
    }

    pub fn invoice(mut self, invoice_id: Option<&str>) -> Self {
        self.stripe_invoice_id = invoice_id.map(str::to_string);
        self
    }
}

/// A stored history row, as listed to the user
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Uuid,
    pub action: String,
    pub old_plan: Option<String>,
    pub new_plan: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// `999` -> `"9.99"`
pub fn format_minor_units(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor_units() {
        assert_eq!(format_minor_units(999), "9.99");
        assert_eq!(format_minor_units(9999), "99.99");
        assert_eq!(format_minor_units(5), "0.05");
        assert_eq!(format_minor_units(0), "0.00");
        assert_eq!(format_minor_units(-250), "-2.50");
    }

    #[test]
    fn test_entry_builder_uppercases_currency() {
        let entry = HistoryEntry::new(
            Uuid::nil(),
            HistoryAction::PaymentSucceeded,
            "paid",
            OffsetDateTime::UNIX_EPOCH,
        )
        .amount(1999, Some("usd"));
        assert_eq!(entry.amount.as_deref(), Some("19.99"));
        assert_eq!(entry.currency.as_deref(), Some("USD"));
    }
}
