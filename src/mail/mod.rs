//! Outbound email

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub subject: String,
    pub html: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// Delivers email. Errors are treated as transient by callers.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Sender that logs each message instead of delivering it
#[derive(Debug, Clone)]
pub struct LogEmailSender {
    from_name: String,
    from_address: String,
}

impl LogEmailSender {
    pub fn new(from_name: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            from_name: from_name.into(),
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, message: &EmailMessage) -> anyhow::Result<()> {
        if message.to.is_empty() {
            anyhow::bail!("email has no recipients");
        }
        info!(
            from = %format!("{} <{}>", self.from_name, self.from_address),
            to = ?message.to,
            cc = ?message.cc,
            bcc = ?message.bcc,
            subject = %message.subject,
            "Email sent"
        );
        Ok(())
    }
}
