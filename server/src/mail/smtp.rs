use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::{EmailMessage, MailClient, MailError};
use crate::config::SmtpSettings;

pub struct SmtpMailClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailClient {
    pub fn new(smtp: &SmtpSettings, from: &str) -> Result<Self, MailError> {
        let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .map_err(|e| MailError::Transport(format!("failed to create SMTP transport: {e}")))?
            .port(smtp.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from: from.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl MailClient for SmtpMailClient {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| MailError::Address(format!("{}: {e}", self.from)))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| MailError::Address(format!("{}: {e}", message.to)))?;

        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone());

        let email = match (message.body_html, message.body_text) {
            (Some(html), Some(text)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            ),
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html),
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text),
            (None, None) => {
                return Err(MailError::Build(
                    "email must have either HTML or text body".to_string(),
                ))
            }
        }
        .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        Ok(())
    }

    fn from_address(&self) -> &str {
        &self.from
    }
}
