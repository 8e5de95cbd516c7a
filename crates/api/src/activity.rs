//! User activity log

use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityAction {
    SignUp,
    SignIn,
    SignOut,
    PasswordReset,
    EmailVerified,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::SignUp => "sign_up",
            ActivityAction::SignIn => "sign_in",
            ActivityAction::SignOut => "sign_out",
            ActivityAction::PasswordReset => "password_reset",
            ActivityAction::EmailVerified => "email_verified",
        }
    }
}

/// Longest value the `ip_address` column holds
const MAX_IP_LENGTH: usize = 45;

/// Record an activity row (fire and forget)
///
/// A failed insert is logged and never fails the request.
pub fn log_activity(pool: PgPool, user_id: Uuid, action: ActivityAction, ip_address: Option<String>) {
    let ip_address = ip_address.filter(|ip| ip.len() <= MAX_IP_LENGTH);
    tokio::spawn(async move {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_logs (user_id, action, ip_address)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(action.as_str())
        .bind(ip_address)
        .execute(&pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(user_id = %user_id, action = action.as_str(), error = %e, "Failed to record activity");
        }
    });
}
