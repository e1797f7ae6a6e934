//! Contact form hand-off.
//!
//! Delivery is stubbed: [`LogMailer`] records each message as a structured
//! log event instead of talking to an SMTP server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kpcyber_core::{DomainError, DomainResult};

/// A message submitted through the site's contact form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactMessage {
    pub name: String,
    pub email: String,
    pub message: String,
}

impl ContactMessage {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name is required"));
        }
        if self.message.trim().is_empty() {
            return Err(DomainError::validation("message is required"));
        }
        match self.email.trim().split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => Ok(()),
            _ => Err(DomainError::validation("email must be a valid address")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailerError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound channel for contact messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &ContactMessage) -> Result<(), MailerError>;
}

/// Mailer that only logs.
#[derive(Debug, Clone, Default)]
pub struct LogMailer {
    inbox: Option<String>,
}

impl LogMailer {
    pub fn new(inbox: Option<String>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &ContactMessage) -> Result<(), MailerError> {
        tracing::info!(
            inbox = self.inbox.as_deref().unwrap_or("<unset>"),
            from_name = %message.name,
            from_email = %message.email,
            length = message.message.len(),
            "contact message accepted (delivery stubbed)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(email: &str) -> ContactMessage {
        ContactMessage {
            name: "Ayesha".to_string(),
            email: email.to_string(),
            message: "I need a website".to_string(),
        }
    }

    #[test]
    fn accepts_plain_address() {
        assert_eq!(message("ayesha@example.com").validate(), Ok(()));
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "ayesha", "@example.com", "ayesha@", "a@b@c"] {
            assert!(message(bad).validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn rejects_blank_message() {
        let mut msg = message("ayesha@example.com");
        msg.message = "  ".to_string();
        assert!(matches!(msg.validate(), Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn log_mailer_never_fails() {
        let mailer = LogMailer::new(Some("hello@agency.test".to_string()));
        assert_eq!(mailer.send(&message("ayesha@example.com")).await, Ok(()));
    }
}
