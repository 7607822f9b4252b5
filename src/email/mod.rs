use lettre::message::Mailbox;
use lettre::{transport::smtp::authentication::Credentials, Message, SmtpTransport, Transport};
use log::{info, warn};
use thiserror::Error;

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mailbox address: {0}")]
    Address(String),
    #[error("failed to build email: {0}")]
    Build(String),
    #[error("smtp failure: {0}")]
    Smtp(String),
    #[error("mail transport is not configured")]
    Disabled,
}

/// Single best-effort send; retries are the caller's concern.
pub trait Notifier: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

pub struct SmtpNotifier {
    mailer: SmtpTransport,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| MailError::Address(e.to_string()))?;
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = SmtpTransport::relay(&config.host)
            .map_err(|e| MailError::Smtp(e.to_string()))?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self { mailer, from })
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(to
                .parse::<Mailbox>()
                .map_err(|e| MailError::Address(e.to_string()))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.mailer
            .send(&email)
            .map_err(|e| MailError::Smtp(e.to_string()))?;
        info!("notification sent to {to}");
        Ok(())
    }
}

/// Stands in when SMTP credentials are absent so the server still boots.
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), MailError> {
        warn!("mail transport disabled; dropping notification for {to}");
        Err(MailError::Disabled)
    }
}
