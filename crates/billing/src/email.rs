//! Subscription notification emails

use std::sync::Arc;

use boilerkit_shared::{EmailMessage, Mailer};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::lifecycle::{BillingSnapshot, Notification};

const SIGNATURE: &str = "Best regards,\nThe Boilerkit team";

/// Renders lifecycle notifications and hands them to the mailer
#[derive(Clone)]
pub struct BillingNotifier {
    mailer: Arc<dyn Mailer>,
    action_url: String,
}

impl BillingNotifier {
    pub fn new(mailer: Arc<dyn Mailer>, action_url: impl Into<String>) -> Self {
        Self {
            mailer,
            action_url: action_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Send every notification to the snapshot's owner
    ///
    /// Failures are logged and swallowed: billing state is already committed
    /// by the time mail goes out.
    pub async fn deliver(&self, recipient: &BillingSnapshot, notifications: &[Notification]) {
        for notification in notifications {
            let message = self.render(recipient, notification);
            if let Err(e) = self.mailer.send(message).await {
                tracing::error!(
                    user_id = %recipient.user_id,
                    notification = ?notification,
                    error = %e,
                    "Failed to send billing notification"
                );
            }
        }
    }

    pub fn render(&self, recipient: &BillingSnapshot, notification: &Notification) -> EmailMessage {
        let name = if recipient.name.trim().is_empty() {
            "there"
        } else {
            recipient.name.as_str()
        };
        let manage = &self.action_url;
        let payment = format!("{}/payment", self.action_url);

        let (subject, body) = match notification {
            Notification::TrialStarted { trial_end } => (
                "Welcome to your Boilerkit trial".to_string(),
                format!(
                    "We're excited to have you on a free Boilerkit trial.\n\n\
                     {}You have access to every premium feature, so take the time to explore.\n\n\
                     Manage your subscription: {manage}",
                    trial_end
                        .map(|end| format!("Your trial runs until {}. ", format_date(end)))
                        .unwrap_or_default()
                ),
            ),
            Notification::TrialEnding { days_left } => (
                "Your trial is ending soon".to_string(),
                format!(
                    "Your Boilerkit trial ends in {days_left} day{}.\n\n\
                     Subscribe before it ends to keep using Boilerkit without interruption.\n\n\
                     Manage your subscription: {manage}",
                    if *days_left > 1 { "s" } else { "" }
                ),
            ),
            Notification::TrialLastDay => (
                "Last day of your trial".to_string(),
                format!(
                    "Today is the last day of your Boilerkit trial.\n\n\
                     Subscribe today to avoid any interruption.\n\n\
                     Manage your subscription: {manage}"
                ),
            ),
            Notification::TrialEnded => (
                "Your trial has ended".to_string(),
                format!(
                    "Your Boilerkit trial is over. We hope you enjoyed it.\n\n\
                     Subscribe now to keep using premium features.\n\n\
                     Manage your subscription: {manage}"
                ),
            ),
            Notification::SubscriptionCreated { plan_name } => (
                "Welcome to your Boilerkit subscription".to_string(),
                format!(
                    "Thank you for subscribing to the {plan_name} plan. Your subscription is now active.\n\n\
                     Manage your subscription: {manage}"
                ),
            ),
            Notification::PlanChanged { plan_name } => (
                "Your plan has changed".to_string(),
                format!(
                    "Your subscription is now on the {plan_name} plan.\n\n\
                     Manage your subscription: {manage}"
                ),
            ),
            Notification::SubscriptionCancelled { access_until } => (
                "Your Boilerkit subscription was cancelled".to_string(),
                format!(
                    "We confirm the cancellation of your Boilerkit subscription.\n\n\
                     You keep access until the end of the current billing period{}.\n\n\
                     Changed your mind? You can reactivate at any time: {manage}",
                    access_until
                        .map(|end| format!(" ({})", format_date(end)))
                        .unwrap_or_default()
                ),
            ),
            Notification::SubscriptionExpired => (
                "Your subscription has expired".to_string(),
                format!(
                    "Your Boilerkit subscription has expired and premium features are no longer available.\n\n\
                     Resubscribe to get access back:\n{manage}"
                ),
            ),
            Notification::PaymentFailed => (
                "Your subscription payment failed".to_string(),
                format!(
                    "We could not process the payment for your Boilerkit subscription.\n\n\
                     Please check your payment details to avoid losing access.\n\n\
                     Update your payment details: {payment}"
                ),
            ),
            Notification::PaymentRetry { retry_at } => (
                "We'll retry your payment".to_string(),
                format!(
                    "Your last payment could not be processed. We will try again on {}.\n\n\
                     Please check your payment details before then.\n\n\
                     Update your payment details: {payment}",
                    format_date(*retry_at)
                ),
            ),
        };

        EmailMessage::new(
            recipient.email.clone(),
            subject,
            format!("Hello {name},\n\n{body}\n\n{SIGNATURE}"),
        )
    }
}

/// `March 5, 2025`
fn format_date(date: OffsetDateTime) -> String {
    let format = format_description!("[month repr:long] [day padding:none], [year]");
    date.format(&format).unwrap_or_else(|_| date.date().to_string())
}
