use axum::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, Message},
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub mod queue;

pub use queue::{MailJob, MailQueue, MailWorkers};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(String),
    #[error("message build failed: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Mail templates known to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Welcome,
    Activation,
    ActivationRenewal,
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Template::Welcome => "welcome",
            Template::Activation => "activation",
            Template::ActivationRenewal => "activation_renewal",
        }
    }

    /// Returns `(subject, plain-text body)`.
    pub fn render(&self, data: &Value) -> (String, String) {
        let token = data["activationToken"].as_str().unwrap_or_default();
        let expiry = data["expiry"].as_str().unwrap_or("soon");
        let instructions = format!(
            "Please send a `PUT /v1/users/activated` request with the following JSON body \
             to activate your account:\n\n{{\"token\": \"{token}\"}}\n\n\
             This is a one-time token and it expires at {expiry}."
        );
        match self {
            Template::Welcome => (
                "Welcome!".to_string(),
                format!("Hi,\n\nThanks for signing up.\n\n{instructions}\n\nThanks,\nThe Gatekeeper Team\n"),
            ),
            Template::Activation => (
                "Activate your account".to_string(),
                format!("Hi,\n\n{instructions}\n\nThanks,\nThe Gatekeeper Team\n"),
            ),
            Template::ActivationRenewal => (
                "Your activation link has been renewed".to_string(),
                format!(
                    "Hi,\n\nYour previous activation token expired before it was used, \
                     so here is a new one.\n\n{instructions}\n\nThanks,\nThe Gatekeeper Team\n"
                ),
            ),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, template: Template, data: &Value) -> Result<(), MailError>;
}

/// Delivers mail over SMTP.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(smtp_url: &str, from_address: &str) -> Result<Self, MailError> {
        // The transport's pool must only be dropped inside a runtime.
        let from = from_address
            .parse::<Mailbox>()
            .map_err(|e| MailError::Address(e.to_string()))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(smtp_url)?.build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, recipient: &str, template: Template, data: &Value) -> Result<(), MailError> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|e| MailError::Address(e.to_string()))?;
        let (subject, body) = template.render(data);
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;
        self.transport.send(message).await?;
        debug!(recipient, template = template.name(), "mail delivered");
        Ok(())
    }
}

/// Used when no SMTP server is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, recipient: &str, template: Template, _data: &Value) -> Result<(), MailError> {
        info!(
            recipient,
            template = template.name(),
            "email not configured, skipping delivery"
        );
        Ok(())
    }
}
