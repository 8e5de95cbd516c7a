//! Billing persistence
//!
//! Billing state is stored on the `users` row; history and the webhook
//! idempotency ledger have their own tables.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingNotifier;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionStatus;
use crate::history::{HistoryEntry, HistoryRecord};
use crate::lifecycle::{BillingSnapshot, Reconciliation, TrialNotice};

/// Events stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Result of trying to claim a webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns processing
    Claimed,
    /// Already processed, or another worker holds it
    Duplicate { status: Option<String> },
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn snapshot(&self, user_id: Uuid) -> BillingResult<Option<BillingSnapshot>>;

    async fn snapshot_by_customer(&self, customer_id: &str) -> BillingResult<Option<BillingSnapshot>>;

    async fn snapshot_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingSnapshot>>;

    /// Write the snapshot (when given) and append history in one transaction
    ///
    /// The write only lands if the row is still at `snapshot.version`;
    /// otherwise nothing is written and `ConcurrentUpdate` is returned.
    /// History rows repeating an invoice and action already recorded are
    /// dropped.
    async fn save(
        &self,
        snapshot: Option<&BillingSnapshot>,
        history: &[HistoryEntry],
    ) -> BillingResult<()>;

    /// Newest first
    async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<HistoryRecord>>;

    async fn active_trials(&self) -> BillingResult<Vec<BillingSnapshot>>;

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    /// Record `success`, or `error` with a message
    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;
}

/// Attempts before giving up on a row that keeps changing underneath
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Fold a change into a user's billing state, persist it and notify
///
/// `apply` runs against `snapshot` first. If another writer saved the row in
/// between, the row is reloaded and `apply` runs again on the fresh state, so
/// a write never overwrites fields it did not read. Notifications go out after
/// the write commits; delivery failures are logged by the notifier and never
/// undo the state change.
///
/// The returned snapshot carries the version it was written at.
pub async fn reconcile<F>(
    store: &dyn BillingStore,
    notifier: &BillingNotifier,
    snapshot: BillingSnapshot,
    apply: F,
) -> BillingResult<Reconciliation>
where
    F: Fn(&BillingSnapshot) -> BillingResult<Reconciliation> + Send,
{
    let user_id = snapshot.user_id;
    let mut current = snapshot;
    let mut attempt = 1;

    loop {
        let mut rec = apply(&current)?;
        match persist(store, &rec).await {
            Ok(()) => {
                if rec.changed() {
                    rec.next.version += 1;
                }
                notifier.deliver(&rec.next, &rec.notifications).await;
                return Ok(rec);
            }
            Err(BillingError::ConcurrentUpdate(_)) if attempt < MAX_WRITE_ATTEMPTS => {
                tracing::warn!(user_id = %user_id, attempt = attempt, "Billing state changed concurrently, reloading");
                current = store
                    .snapshot(user_id)
                    .await?
                    .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn persist(store: &dyn BillingStore, rec: &Reconciliation) -> BillingResult<()> {
    if rec.changed() || !rec.history.is_empty() {
        let snapshot = rec.changed().then_some(&rec.next);
        store.save(snapshot, &rec.history).await?;
    }
    Ok(())
}

const SNAPSHOT_COLUMNS: &str = r#"
    id, email, name, is_trial_active, has_used_trial, trial_start_date, trial_end_date,
    trial_last_notice, stripe_customer_id, stripe_subscription_id, stripe_price_id,
    stripe_current_period_end, stripe_subscription_status, stripe_cancel_at_period_end,
    last_billing_event_at, billing_version
"#;

#[derive(Debug, sqlx::FromRow)]
struct BillingRow {
    id: Uuid,
    email: String,
    name: String,
    is_trial_active: bool,
    has_used_trial: bool,
    trial_start_date: Option<OffsetDateTime>,
    trial_end_date: Option<OffsetDateTime>,
    trial_last_notice: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_price_id: Option<String>,
    stripe_current_period_end: Option<OffsetDateTime>,
    stripe_subscription_status: Option<String>,
    stripe_cancel_at_period_end: bool,
    last_billing_event_at: Option<OffsetDateTime>,
    billing_version: i64,
}

impl From<BillingRow> for BillingSnapshot {
    fn from(row: BillingRow) -> Self {
        Self {
            user_id: row.id,
            email: row.email,
            name: row.name,
            is_trial_active: row.is_trial_active,
            has_used_trial: row.has_used_trial,
            trial_start_date: row.trial_start_date,
            trial_end_date: row.trial_end_date,
            trial_last_notice: row.trial_last_notice.as_deref().and_then(TrialNotice::parse),
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_price_id: row.stripe_price_id,
            stripe_current_period_end: row.stripe_current_period_end,
            subscription_status: row
                .stripe_subscription_status
                .as_deref()
                .map(SubscriptionStatus::parse),
            cancel_at_period_end: row.stripe_cancel_at_period_end,
            last_billing_event_at: row.last_billing_event_at,
            version: row.billing_version,
        }
    }
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn snapshot_where(
        &self,
        column: &str,
        value: &str,
    ) -> BillingResult<Option<BillingSnapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM users WHERE {column} = $1");
        let row: Option<BillingRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn snapshot(&self, user_id: Uuid) -> BillingResult<Option<BillingSnapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM users WHERE id = $1");
        let row: Option<BillingRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn snapshot_by_customer(&self, customer_id: &str) -> BillingResult<Option<BillingSnapshot>> {
        self.snapshot_where("stripe_customer_id", customer_id).await
    }

    async fn snapshot_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingSnapshot>> {
        self.snapshot_where("stripe_subscription_id", subscription_id)
            .await
    }

    async fn save(
        &self,
        snapshot: Option<&BillingSnapshot>,
        history: &[HistoryEntry],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(s) = snapshot {
            let result = sqlx::query(
                r#"
                UPDATE users SET
                    is_trial_active = $2,
                    has_used_trial = $3,
                    trial_start_date = $4,
                    trial_end_date = $5,
                    trial_last_notice = $6,
                    stripe_customer_id = $7,
                    stripe_subscription_id = $8,
                    stripe_price_id = $9,
                    stripe_current_period_end = $10,
                    stripe_subscription_status = $11,
                    stripe_cancel_at_period_end = $12,
                    last_billing_event_at = $13,
                    billing_version = billing_version + 1,
                    updated_at = NOW()
                WHERE id = $1 AND billing_version = $14
                "#,
            )
            .bind(s.user_id)
            .bind(s.is_trial_active)
            .bind(s.has_used_trial)
            .bind(s.trial_start_date)
            .bind(s.trial_end_date)
            .bind(s.trial_last_notice.map(|n| n.as_str()))
            .bind(&s.stripe_customer_id)
            .bind(&s.stripe_subscription_id)
            .bind(&s.stripe_price_id)
            .bind(s.stripe_current_period_end)
            .bind(s.subscription_status.map(|st| st.as_str()))
            .bind(s.cancel_at_period_end)
            .bind(s.last_billing_event_at)
            .bind(s.version)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
                    .bind(s.user_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(match exists {
                    Some(_) => BillingError::ConcurrentUpdate(s.user_id.to_string()),
                    None => BillingError::UserNotFound(s.user_id.to_string()),
                });
            }
        }

        for entry in history {
            sqlx::query(
                r#"
                INSERT INTO subscription_history
                    (user_id, action, old_plan, new_plan, amount, currency, status,
                     stripe_event_id, stripe_invoice_id, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (stripe_invoice_id, action) WHERE stripe_invoice_id IS NOT NULL
                DO NOTHING
                "#,
            )
            .bind(entry.user_id)
            .bind(entry.action.as_str())
            .bind(&entry.old_plan)
            .bind(&entry.new_plan)
            .bind(&entry.amount)
            .bind(&entry.currency)
            .bind(&entry.status)
            .bind(&entry.stripe_event_id)
            .bind(&entry.stripe_invoice_id)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRecord>(
            r#"
            SELECT id, action, old_plan, new_plan, amount, currency, status, timestamp
            FROM subscription_history
            WHERE user_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_trials(&self) -> BillingResult<Vec<BillingSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM users WHERE is_trial_active = TRUE AND trial_end_date IS NOT NULL"
        );
        let rows: Vec<BillingRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        // Single statement so concurrent deliveries cannot both claim. Failed
        // events and events stuck in processing can be claimed again.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_at)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(EventClaim::Duplicate {
            status: status.map(|(s,)| s),
        })
    }

    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let result = if error.is_some() { "error" } else { "success" };
        let update = || {
            sqlx::query(
                r#"
                UPDATE stripe_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(result)
            .bind(error)
            .bind(event_id)
            .execute(&self.pool)
        };

        if let Err(e) = update().await {
            tracing::warn!(event_id = %event_id, error = %e, "First attempt to update webhook event failed, retrying");
            update().await.inspect_err(|retry_err| {
                tracing::error!(
                    event_id = %event_id,
                    processing_result = %result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook audit record after retry; event stays in processing until the timeout"
                );
            })?;
        }
        Ok(())
    }
}
