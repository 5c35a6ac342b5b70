use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::Config;
use crate::errors::{GearworkError, Result};

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Abstract sink for failure notifications.
///
/// Non-fatal by contract: callers log a delivery failure and append it to
/// the surfaced job error; it never masks the original failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// SMTP relay settings for the default notifier, loaded from environment
/// variables so deployments can point at their relay without touching the
/// library configuration.
///
/// | Variable        | Default     |
/// |-----------------|-------------|
/// | `SMTP_HOST`     | `localhost` |
/// | `SMTP_PORT`     | `587`       |
/// | `SMTP_USER`     | —           |
/// | `SMTP_PASSWORD` | —           |
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl SmtpSettings {
    pub fn from_env() -> Self {
        SmtpSettings {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            user: std::env::var("SMTP_USER").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
        }
    }
}

/// Default notifier: composes plain-text UTF-8 mail and hands it to
/// lettre's async SMTP transport, one message per configured recipient.
pub struct EmailNotifier {
    smtp: SmtpSettings,
    recipients: Vec<String>,
    from_address: String,
    subject_prefix: String,
}

impl EmailNotifier {
    pub fn new(
        smtp: SmtpSettings,
        recipients: Vec<String>,
        from_address: String,
        subject_prefix: String,
    ) -> Self {
        EmailNotifier {
            smtp,
            recipients,
            from_address,
            subject_prefix,
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)
            .map_err(|e| GearworkError::Notifier(format!("smtp transport: {e}")))?
            .port(self.smtp.port);

        if let (Some(user), Some(password)) = (&self.smtp.user, &self.smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let mailer = self.transport()?;
        let subject = format!("{}{subject}", self.subject_prefix);

        for recipient in &self.recipients {
            let email = Message::builder()
                .from(
                    self.from_address
                        .parse()
                        .map_err(|e| GearworkError::Notifier(format!("from address: {e}")))?,
                )
                .to(recipient
                    .parse()
                    .map_err(|e| GearworkError::Notifier(format!("recipient address: {e}")))?)
                .subject(subject.clone())
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .map_err(|e| GearworkError::Notifier(format!("message build: {e}")))?;

            mailer
                .send(email)
                .await
                .map_err(|e| GearworkError::Notifier(format!("smtp send: {e}")))?;

            info!(to = %recipient, subject = %subject, "Failure notification sent");
        }

        Ok(())
    }
}

/// Build the configured notifier, or `None` when the recipient list is
/// empty (notifications disabled).
pub fn notifier_from_config(config: &Config) -> Option<std::sync::Arc<dyn Notifier>> {
    if !config.notifications_enabled() {
        return None;
    }

    Some(std::sync::Arc::new(EmailNotifier::new(
        SmtpSettings::from_env(),
        config.notifications_emails.clone(),
        config.notifications_from_address.clone(),
        config.notifications_subject_prefix.clone(),
    )))
}
