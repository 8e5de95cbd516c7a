//! Outbound email transport
//!
//! Templates live with the code that sends them (auth emails in the API crate,
//! subscription notifications in the billing crate). This module only moves a
//! rendered [`EmailMessage`] to a provider.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const RESEND_API_URL: &str = "https://api.resend.com";
const DEFAULT_FROM: &str = "Boilerkit <contact@boilerkit.dev>";

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email transport error: {0}")]
    Transport(String),
    #[error("Email provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl EmailError {
    /// Network failures and provider 5xx/429 responses are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            EmailError::Transport(_) => true,
            EmailError::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// A rendered plain-text email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError>;
}

/// Pick the transport from the environment
///
/// Uses Resend when `RESEND_API_KEY` is set, otherwise logs messages instead
/// of sending them.
pub fn mailer_from_env() -> Arc<dyn Mailer> {
    let from = std::env::var("EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string());
    match std::env::var("RESEND_API_KEY") {
        Ok(key) if !key.is_empty() => {
            tracing::info!("Email delivery enabled via Resend");
            Arc::new(ResendMailer::new(key, from))
        }
        _ => {
            tracing::warn!("Email delivery not configured (missing RESEND_API_KEY) - emails will be logged");
            Arc::new(LogMailer)
        }
    }
}

#[derive(Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Sends through the Resend HTTP API
#[derive(Clone)]
pub struct ResendMailer {
    client: Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            from: from.into(),
            base_url: RESEND_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn send_once(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let payload = ResendPayload {
            from: &self.from,
            to: [message.to.as_str()],
            subject: &message.subject,
            text: &message.text,
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(EmailError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .map(jitter)
            .take(2);

        RetryIf::spawn(strategy, || self.send_once(&message), EmailError::is_transient)
            .await
            .inspect_err(|e| {
                tracing::error!(to = %message.to, subject = %message.subject, error = %e, "Failed to send email");
            })?;

        tracing::info!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}

/// Logs messages instead of delivering them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            body = %message.text,
            "Email delivery disabled - message logged"
        );
        Ok(())
    }
}

/// Keeps sent messages in memory
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        match self.sent.lock() {
            Ok(mut guard) => guard.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
        Ok(())
    }
}
