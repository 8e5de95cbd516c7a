//! Account emails: verification, password reset, account deletion

use std::sync::Arc;

use boilerkit_shared::{EmailMessage, Mailer};

const SIGNATURE: &str = "Best regards,\nThe Boilerkit team";

#[derive(Clone)]
pub struct AuthEmails {
    mailer: Arc<dyn Mailer>,
    app_url: String,
    api_url: String,
}

impl AuthEmails {
    pub fn new(mailer: Arc<dyn Mailer>, app_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            mailer,
            app_url: app_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn verification(&self, to: &str, name: &str, token: &str) -> EmailMessage {
        let link = format!("{}/api/auth/verify-email?token={token}", self.api_url);
        EmailMessage::new(
            to,
            "Verify your email address",
            format!(
                "Hello {},\n\nConfirm your email address to finish setting up your Boilerkit account:\n\n{link}\n\n\
                 This link expires in 24 hours. If you did not sign up, ignore this email.\n\n{SIGNATURE}",
                display_name(name)
            ),
        )
    }

    pub fn password_reset(&self, to: &str, name: &str, token: &str) -> EmailMessage {
        let link = format!("{}/reset-password?token={token}", self.app_url);
        EmailMessage::new(
            to,
            "Reset your password",
            format!(
                "Hello {},\n\nSomeone asked to reset the password of your Boilerkit account. \
                 Choose a new one here:\n\n{link}\n\n\
                 This link expires in 24 hours. If it wasn't you, ignore this email and your password stays the same.\n\n{SIGNATURE}",
                display_name(name)
            ),
        )
    }

    pub fn delete_account(&self, to: &str, name: &str, token: &str) -> EmailMessage {
        let link = format!("{}/api/auth/delete-user/callback?token={token}", self.api_url);
        EmailMessage::new(
            to,
            "Confirm account deletion",
            format!(
                "Hello {},\n\nConfirm that you want to delete your Boilerkit account:\n\n{link}\n\n\
                 Deletion is permanent and cancels any active subscription at the end of its period. \
                 This link expires in 24 hours.\n\n{SIGNATURE}",
                display_name(name)
            ),
        )
    }

    /// Send without failing the caller
    pub async fn send(&self, message: EmailMessage) {
        let subject = message.subject.clone();
        let to = message.to.clone();
        if let Err(e) = self.mailer.send(message).await {
            tracing::error!(to = %to, subject = %subject, error = %e, "Failed to send account email");
        }
    }
}

fn display_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "there"
    } else {
        name
    }
}
