//! Trial reminders and expiry
//!
//! Run periodically by the worker. Each active trial gets at most one
//! reminder per stage; card-less trials are expired once their end date
//! passes.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::email::BillingNotifier;
use crate::error::BillingResult;
use crate::lifecycle::Reconciler;
use crate::plans::PlanCatalog;
use crate::store::{self, BillingStore};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialSweep {
    pub checked: usize,
    pub reminded: usize,
    pub expired: usize,
    pub failed: usize,
}

pub struct TrialMonitor {
    store: Arc<dyn BillingStore>,
    notifier: BillingNotifier,
    catalog: Arc<PlanCatalog>,
}

impl TrialMonitor {
    pub fn new(store: Arc<dyn BillingStore>, notifier: BillingNotifier, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            store,
            notifier,
            catalog,
        }
    }

    /// Check every active trial once
    ///
    /// A failure on one user is logged and counted; the sweep continues.
    pub async fn run_once(&self, now: OffsetDateTime) -> BillingResult<TrialSweep> {
        let trials = self.store.active_trials().await?;
        let reconciler = Reconciler::new(&self.catalog);
        let mut sweep = TrialSweep {
            checked: trials.len(),
            ..TrialSweep::default()
        };

        for snapshot in trials {
            let user_id = snapshot.user_id;
            let result = store::reconcile(self.store.as_ref(), &self.notifier, snapshot, |s| {
                Ok(reconciler.apply_trial_clock(s, now))
            })
            .await;

            match result {
                Ok(rec) if rec.is_noop() => {}
                Ok(rec) if !rec.next.is_trial_active => {
                    sweep.expired += 1;
                    tracing::info!(user_id = %user_id, "Trial expired");
                }
                Ok(rec) => {
                    sweep.reminded += 1;
                    tracing::info!(user_id = %user_id, notice = ?rec.next.trial_last_notice, "Trial reminder sent");
                }
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Failed to update trial");
                }
            }
        }

        Ok(sweep)
    }
}
