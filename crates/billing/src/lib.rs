// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Boilerkit Billing Module
//!
//! Stripe subscription billing for a single paid plan.
//!
//! ## Features
//!
//! - **Checkout & Portal**: Stripe Checkout for new subscribers, the billing
//!   portal for paying customers
//! - **Lifecycle**: Webhook events reconciled into the user row (trials,
//!   plan changes, cancellation, payment failures and recovery)
//! - **Idempotency**: Every webhook event is claimed once in a ledger table
//! - **Trials**: Card-less trials with escalating reminders and expiry
//! - **Email Notifications**: Trial, subscription and payment emails
//! - **Invariants**: Read-only consistency checks for the worker

pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod history;
pub mod invariants;
pub mod lifecycle;
pub mod memory;
pub mod plans;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod trials;
pub mod webhooks;


use std::sync::Arc;

use boilerkit_shared::Mailer;
use sqlx::PgPool;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Email
pub use email::BillingNotifier;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, ProviderEvent, SubscriptionObject, SubscriptionStatus};

// History
pub use history::{HistoryAction, HistoryEntry, HistoryRecord};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Lifecycle
pub use lifecycle::{BillingSnapshot, LifecycleState, Notification, Reconciler, Reconciliation, TrialNotice};

// Doubles
pub use memory::{MemoryBillingStore, MemoryPaymentProvider};

// Plans
pub use plans::{BillingInterval, FreePlan, Plan, PlanCatalog};

// Provider
pub use provider::{CheckoutRequest, CheckoutSessionCreated, PaymentProvider};

// Store
pub use store::{BillingStore, EventClaim, PgBillingStore};

// Subscriptions
pub use subscriptions::{is_pro, PlanView, SubscriptionService, SubscriptionStatusView};

// Trials
pub use trials::{TrialMonitor, TrialSweep};

// Webhooks
pub use webhooks::{signature_header, verify_signature, WebhookHandler, WebhookOutcome};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub trials: TrialMonitor,
    pub catalog: Arc<PlanCatalog>,
    pub config: StripeConfig,
}

impl BillingService {
    /// Wire the services around a store, a provider and a mailer
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let catalog = Arc::new(PlanCatalog::with_prices(&config.price_ids));
        let notifier = BillingNotifier::new(mailer, config.action_url.clone());

        Self {
            subscriptions: SubscriptionService::new(
                store.clone(),
                provider.clone(),
                notifier.clone(),
                catalog.clone(),
                config.trial_period_days,
            ),
            webhooks: WebhookHandler::new(
                store.clone(),
                provider,
                notifier.clone(),
                catalog.clone(),
                config.webhook_secret.clone(),
            ),
            trials: TrialMonitor::new(store, notifier, catalog.clone()),
            catalog,
            config,
        }
    }

    /// Stripe and Postgres backed service from environment configuration
    pub fn from_env(pool: PgPool, mailer: Arc<dyn Mailer>) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let provider = Arc::new(StripeClient::new(config.clone()));
        let store = Arc::new(PgBillingStore::new(pool));
        Ok(Self::new(config, store, provider, mailer))
    }

    /// Invariant checker over the same catalog
    pub fn invariant_checker(&self, pool: PgPool) -> InvariantChecker {
        InvariantChecker::new(pool, (*self.catalog).clone())
    }
}
