//! Boilerkit Background Worker
//!
//! Handles scheduled jobs including:
//! - Trial reminders and expiry (hourly)
//! - Billing invariant checks (daily at 2:00 AM UTC)
//! - Expired session and verification token purge (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)
//!
//! Without Stripe configuration only the purge and heartbeat jobs run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use boilerkit_api::auth::{sessions, tokens};
use boilerkit_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use boilerkit_shared::mailer_from_env;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Days a revoked or expired session row is kept for auditing
const SESSION_RETENTION_DAYS: i32 = 7;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log an invariant run, one line per violation
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            checks_passed = summary.checks_passed,
            "Billing invariants hold"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                affected_users = violation.user_ids.len(),
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                affected_users = violation.user_ids.len(),
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Boilerkit Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone(), mailer_from_env()) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            None
        }
    };
    let minimal_mode = billing.is_none();

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    if let Some(billing) = &billing {
        // Job 1: Trial reminders and expiry (top of every hour)
        let trial_billing = billing.clone();
        scheduler
            .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
                let billing = trial_billing.clone();
                Box::pin(async move {
                    info!("Running trial monitor");
                    match billing.trials.run_once(OffsetDateTime::now_utc()).await {
                        Ok(sweep) => info!(
                            checked = sweep.checked,
                            reminded = sweep.reminded,
                            expired = sweep.expired,
                            failed = sweep.failed,
                            "Trial monitor complete"
                        ),
                        Err(e) => error!(error = %e, "Trial monitor failed"),
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Trial monitor (hourly)");
        job_count += 1;

        // Job 2: Billing invariant checks (daily at 2:00 AM UTC)
        let checker = Arc::new(billing.invariant_checker(pool.clone()));
        scheduler
            .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
                let checker = checker.clone();
                Box::pin(async move {
                    info!("Running billing invariant checks");
                    match checker.run_all_checks().await {
                        Ok(summary) => log_invariant_summary(&summary),
                        Err(e) => error!(error = %e, "Billing invariant checks failed"),
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Billing invariant checks (daily at 2:00 AM UTC)");
        job_count += 1;
    } else {
        info!("Worker running without Stripe integration");
    }

    // Job 3: Purge expired sessions and verification tokens (daily at 3:00 AM UTC)
    let purge_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = purge_pool.clone();
            Box::pin(async move {
                info!("Running session purge");
                match sessions::purge_expired_sessions(&pool, SESSION_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Expired sessions purged"),
                    Err(e) => error!(error = %e, "Session purge failed"),
                }
                match tokens::purge_expired(&pool).await {
                    Ok(deleted) => info!(deleted = deleted, "Expired verification tokens purged"),
                    Err(e) => error!(error = %e, "Verification token purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Session purge (daily at 3:00 AM UTC)");
    job_count += 1;

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                if minimal_mode {
                    info!("Worker heartbeat (minimal mode)");
                } else {
                    info!("Worker heartbeat");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");
    job_count += 1;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Boilerkit Worker started successfully with {} scheduled jobs",
        job_count
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
