//! Application state

use std::sync::Arc;

use boilerkit_billing::BillingService;
use boilerkit_shared::Mailer;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    email::AuthEmails,
    error::{ApiError, ApiResult},
    storage::{storage_from_config, FileStorage},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Present when Stripe is configured and `ENABLE_BILLING` is not false
    pub billing: Option<Arc<BillingService>>,
    pub storage: Arc<dyn FileStorage>,
    pub auth_emails: AuthEmails,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, mailer: Arc<dyn Mailer>) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone(), mailer.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        let storage = storage_from_config(&config.upload);
        Self::from_parts(pool, config, mailer, billing, storage)
    }

    /// Assemble state from already-built collaborators
    pub fn from_parts(
        pool: PgPool,
        config: Config,
        mailer: Arc<dyn Mailer>,
        billing: Option<Arc<BillingService>>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let auth_emails = AuthEmails::new(mailer, config.app_url.clone(), config.api_url.clone());

        Self {
            pool,
            jwt_manager,
            billing,
            storage,
            auth_emails,
            config,
        }
    }

    /// Create AuthState for the auth middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Billing service, or 503 when billing is off
    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not available".to_string()))
    }
}
