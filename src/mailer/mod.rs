//! Outbound mail transports.
//!
//! Every transport runs the message headers through the
//! [`HeaderEnhancer`](crate::deliverability::HeaderEnhancer) before handing
//! the message off, so callers only attach the `X-WNS` marker and whatever
//! base headers they need.
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`SmtpMailer`] | real delivery through an SMTP relay |
//! | [`LogMailer`] | development, writes the message to the log |
//! | [`RecordingMailer`] | tests, keeps every message in memory |

mod log_mailer;
mod recording;
mod smtp;

pub use log_mailer::LogMailer;
pub use recording::RecordingMailer;
pub use smtp::SmtpMailer;

use crate::config::{MailSettings, MailTransportKind};
use crate::deliverability::HeaderEnhancer;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("SMTP error: {0}")]
    Smtp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    /// Raw `Name: value` lines.
    pub headers: Vec<String>,
}

/// Blocking mail transport. Call from `spawn_blocking` in async code.
pub trait Mailer: Send + Sync {
    fn send(&self, email: &OutgoingEmail) -> Result<(), MailError>;
}

pub fn is_valid_email(email: &str) -> bool {
    email.trim().parse::<lettre::Address>().is_ok()
}

/// Builds the transport selected in the config.
pub fn create_mailer(
    settings: &MailSettings,
    enhancer: HeaderEnhancer,
    site_domain: &str,
) -> Result<Arc<dyn Mailer>, MailError> {
    match settings.transport {
        MailTransportKind::Smtp => {
            let smtp = settings.smtp.as_ref().ok_or_else(|| {
                MailError::MissingConfig("mail.smtp_host".to_string())
            })?;
            Ok(Arc::new(SmtpMailer::new(smtp, enhancer, site_domain)?))
        }
        MailTransportKind::Log => Ok(Arc::new(LogMailer::new(enhancer))),
    }
}

/// Splits a raw header line into trimmed name and value.
pub(crate) fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
