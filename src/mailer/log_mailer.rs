use super::{MailError, Mailer, OutgoingEmail};
use crate::deliverability::HeaderEnhancer;
use tracing::info;

/// Writes messages to the log instead of delivering them.
pub struct LogMailer {
    enhancer: HeaderEnhancer,
}

impl LogMailer {
    pub fn new(enhancer: HeaderEnhancer) -> Self {
        Self { enhancer }
    }
}

impl Mailer for LogMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        if !super::is_valid_email(&email.to) {
            return Err(MailError::InvalidAddress(email.to.clone()));
        }
        let headers = self.enhancer.enhance(&email.headers, &email.to);
        info!(
            "[mail] to={} subject={:?} headers={} body_bytes={}",
            email.to,
            email.subject,
            headers.join(" | "),
            email.html_body.len()
        );
        Ok(())
    }
}
