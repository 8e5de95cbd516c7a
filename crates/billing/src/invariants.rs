//! Billing invariants
//!
//! Read-only consistency checks over the billing columns of `users` and the
//! webhook ledger. Run by the worker after webhook traffic has settled; a
//! violation means a reconciliation bug or a manual edit worth looking at.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plans::PlanCatalog;
use crate::store::PROCESSING_TIMEOUT_MINUTES;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Paying users may be locked out or charged for nothing
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    stripe_subscription_id: Option<String>,
    stripe_subscription_status: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    id: Uuid,
    email: String,
    stripe_price_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

const USER_COLUMNS: &str = "id, email, stripe_subscription_id, stripe_subscription_status";

pub struct InvariantChecker {
    pool: PgPool,
    catalog: PlanCatalog,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self { pool, catalog }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "live_subscription_has_access",
            "subscription_has_customer",
            "price_in_catalog",
            "trial_has_end_date",
            "trial_marked_used",
            "no_stuck_webhook_events",
        ]
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }
        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "live_subscription_has_access" => self.check_live_subscription_has_access().await,
            "subscription_has_customer" => self.check_subscription_has_customer().await,
            "price_in_catalog" => self.check_price_in_catalog().await,
            "trial_has_end_date" => self.check_trial_has_end_date().await,
            "trial_marked_used" => self.check_trial_marked_used().await,
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            _ => Ok(vec![]),
        }
    }

    async fn users_where(&self, condition: &str) -> BillingResult<Vec<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {condition}");
        Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?)
    }

    /// Paying users must have a price and a period end, or they lose access
    async fn check_live_subscription_has_access(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .users_where(
                "stripe_subscription_id IS NOT NULL \
                 AND stripe_subscription_status IN ('active', 'trialing', 'past_due', 'unpaid') \
                 AND (stripe_price_id IS NULL OR stripe_current_period_end IS NULL)",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "live_subscription_has_access".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "User '{}' has a live subscription but no price or period end",
                    row.email
                ),
                context: serde_json::json!({
                    "subscription_id": row.stripe_subscription_id,
                    "status": row.stripe_subscription_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_subscription_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .users_where("stripe_subscription_id IS NOT NULL AND stripe_customer_id IS NULL")
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_has_customer".to_string(),
                user_ids: vec![row.id],
                description: format!("User '{}' has a subscription but no Stripe customer", row.email),
                context: serde_json::json!({
                    "subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Prices outside the catalog render as the free plan
    async fn check_price_in_catalog(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PriceRow> = sqlx::query_as(
            r#"
            SELECT id, email, stripe_price_id
            FROM users
            WHERE stripe_price_id IS NOT NULL
              AND NOT (stripe_price_id = ANY($1))
            "#,
        )
        .bind(self.catalog.price_ids())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "price_in_catalog".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "User '{}' is on price '{}' which is not in the plan catalog",
                    row.email, row.stripe_price_id
                ),
                context: serde_json::json!({
                    "stripe_price_id": row.stripe_price_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_trial_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .users_where("is_trial_active = TRUE AND trial_end_date IS NULL")
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_has_end_date".to_string(),
                user_ids: vec![row.id],
                description: format!("User '{}' has an active trial with no end date", row.email),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_trial_marked_used(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .users_where("is_trial_active = TRUE AND has_used_trial = FALSE")
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_marked_used".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "User '{}' is trialing but could start another trial",
                    row.email
                ),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) has been processing since {:?}",
                    row.stripe_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
