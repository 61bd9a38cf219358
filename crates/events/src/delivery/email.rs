//! Email delivery via SMTP.
//!
//! [`EmailSender`] wraps the `lettre` async SMTP transport to send plain-text
//! notification emails. Configuration is loaded from environment variables;
//! if `SMTP_HOST` is not set, [`EmailConfig::from_env`] returns `None` and the
//! email channel stays unconfigured.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::notification::{Channel, Notification};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::contacts::{require_address, ContactDirectory};
use super::{ChannelSender, DeliveryError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Email build error: {0}")]
    Build(String),
}

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "alerts@beacon.local";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// RFC 5322 "From" address.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl EmailConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMTP_HOST` is not set.
    ///
    /// | Variable        | Required | Default               |
    /// |-----------------|----------|-----------------------|
    /// | `SMTP_HOST`     | yes      |                       |
    /// | `SMTP_PORT`     | no       | `587`                 |
    /// | `SMTP_FROM`     | no       | `alerts@beacon.local` |
    /// | `SMTP_USER`     | no       |                       |
    /// | `SMTP_PASSWORD` | no       |                       |
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok()?;
        Some(Self {
            smtp_host,
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

// ---------------------------------------------------------------------------
// EmailSender
// ---------------------------------------------------------------------------

pub struct EmailSender {
    from_address: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    contacts: Arc<dyn ContactDirectory>,
}

impl EmailSender {
    /// Build the SMTP transport once; connections are pooled by `lettre`.
    pub fn new(config: EmailConfig, contacts: Arc<dyn ContactDirectory>) -> Result<Self, EmailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port);
        if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(Self {
            from_address: config.from_address,
            mailer: builder.build(),
            contacts,
        })
    }
}

fn build_message(from: &str, to: &str, n: &Notification) -> Result<Message, EmailError> {
    Message::builder()
        .from(from.parse()?)
        .to(to.parse()?)
        .subject(n.title.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(n.message.clone())
        .map_err(|e| EmailError::Build(e.to_string()))
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let to =
            require_address(self.contacts.as_ref(), n.tenant_id, n.recipient_id, Channel::Email)
                .await?;
        let message = build_message(&self.from_address, &to, n)?;
        self.mailer.send(message).await.map_err(EmailError::from)?;
        tracing::info!(notification_id = n.id, to = %to, "Notification email sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::notification;

    #[test]
    fn from_env_returns_none_without_smtp_host() {
        std::env::remove_var("SMTP_HOST");
        assert!(EmailConfig::from_env().is_none());
    }

    #[test]
    fn message_carries_title_as_subject() {
        let n = notification(1, Channel::Email);
        let message = build_message("alerts@beacon.local", "ops@example.com", &n).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Chiller offline"));
        assert!(raw.contains("To: ops@example.com"));
    }

    #[test]
    fn bad_recipient_address_is_rejected() {
        let n = notification(1, Channel::Email);
        let err = build_message("alerts@beacon.local", "not-an-email", &n).unwrap_err();
        assert!(err.to_string().contains("Email address parse error"));
    }
}
