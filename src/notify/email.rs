use anyhow::Context as _;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport as _, Message, Tokio1Executor};

use super::{EmailChannel, NotificationEvent};

/// Mail relay settings, read from the environment. All five variables must
/// be present together; with none set the server runs with email delivery
/// disabled.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
}

impl SmtpConfig {
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let host = match std::env::var("MANGASHELF_SMTP_HOST") {
            Ok(host) if !host.trim().is_empty() => host.trim().to_string(),
            _ => return Ok(None),
        };
        let port = std::env::var("MANGASHELF_SMTP_PORT")
            .context("MANGASHELF_SMTP_PORT is required when MANGASHELF_SMTP_HOST is set")?
            .trim()
            .parse::<u16>()
            .context("parse MANGASHELF_SMTP_PORT")?;
        let username = std::env::var("MANGASHELF_SMTP_USERNAME")
            .context("MANGASHELF_SMTP_USERNAME is required when MANGASHELF_SMTP_HOST is set")?;
        let password = std::env::var("MANGASHELF_SMTP_PASSWORD")
            .context("MANGASHELF_SMTP_PASSWORD is required when MANGASHELF_SMTP_HOST is set")?;
        let sender = std::env::var("MANGASHELF_SMTP_SENDER")
            .context("MANGASHELF_SMTP_SENDER is required when MANGASHELF_SMTP_HOST is set")?;
        Ok(Some(Self {
            host,
            port,
            username,
            password,
            sender,
        }))
    }
}

/// Sends notification mails through an SMTPS relay.
pub struct SmtpEmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpEmailChannel {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .with_context(|| format!("build smtp relay for {}", config.host))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        let sender = config
            .sender
            .parse::<Mailbox>()
            .with_context(|| format!("parse sender address: {}", config.sender))?;
        Ok(Self { transport, sender })
    }
}

#[async_trait]
impl EmailChannel for SmtpEmailChannel {
    async fn send(&self, address: &str, event: &NotificationEvent) -> anyhow::Result<()> {
        let recipient = address
            .parse::<Mailbox>()
            .with_context(|| format!("parse recipient address: {address}"))?;

        let message = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(subject(event))
            .header(ContentType::TEXT_PLAIN)
            .body(body(event))
            .context("build notification mail")?;

        self.transport
            .send(message)
            .await
            .context("send notification mail")?;
        tracing::debug!(chapter = event.chapter_number, "notification mail sent");
        Ok(())
    }
}

/// Stand-in used when no relay is configured; subscriptions still work,
/// deliveries report a failure.
pub struct DisabledEmailChannel;

#[async_trait]
impl EmailChannel for DisabledEmailChannel {
    async fn send(&self, _address: &str, _event: &NotificationEvent) -> anyhow::Result<()> {
        anyhow::bail!("smtp relay not configured")
    }
}

fn subject(event: &NotificationEvent) -> String {
    format!("Neues Kapitel {}: {}", event.chapter_number, event.title)
}

fn body(event: &NotificationEvent) -> String {
    format!(
        "Ein neues Kapitel ist verfügbar!\n\nKapitel {}: {}\n\nJetzt herunterladen: {}\n",
        event.chapter_number, event.title, event.url
    )
}
