use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::Config;

mod smtp;

pub use smtp::SmtpMailClient;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(String),

    #[error("failed to build email: {0}")]
    Build(String),

    #[error("failed to send email: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
}

#[async_trait::async_trait]
pub trait MailClient: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError>;
    fn from_address(&self) -> &str;
}

pub type DynMailClient = Arc<dyn MailClient>;

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailClient {
    from: String,
}

impl LogMailClient {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait::async_trait]
impl MailClient for LogMailClient {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
        info!(to = %message.to, subject = %message.subject, "Email not delivered, no SMTP configured");
        Ok(())
    }

    fn from_address(&self) -> &str {
        &self.from
    }
}

pub fn create_mail_client(config: &Config) -> Result<DynMailClient, MailError> {
    match &config.smtp {
        Some(smtp) => {
            let client = SmtpMailClient::new(smtp, &config.mail_from)?;
            info!(host = %smtp.host, "SMTP mail client configured");
            Ok(Arc::new(client))
        }
        None => Ok(Arc::new(LogMailClient::new(config.mail_from.clone()))),
    }
}
