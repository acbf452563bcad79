use super::{MailError, Mailer, OutgoingEmail};
use crate::deliverability::HeaderEnhancer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory transport for tests. Stores each message with its final headers.
#[derive(Default)]
pub struct RecordingMailer {
    enhancer: Option<HeaderEnhancer>,
    sent: Mutex<Vec<OutgoingEmail>>,
    fail: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records headers after the deliverability rewrite.
    pub fn with_enhancer(enhancer: HeaderEnhancer) -> Self {
        Self {
            enhancer: Some(enhancer),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<OutgoingEmail> {
        self.sent()
            .into_iter()
            .filter(|e| e.to.eq_ignore_ascii_case(recipient))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::Smtp("recording mailer set to fail".to_string()));
        }
        if !super::is_valid_email(&email.to) {
            return Err(MailError::InvalidAddress(email.to.clone()));
        }
        let mut email = email.clone();
        if let Some(enhancer) = &self.enhancer {
            email.headers = enhancer.enhance(&email.headers, &email.to);
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            to: to.to_string(),
            subject: "s".to_string(),
            html_body: "b".to_string(),
            headers: vec!["X-WNS: alert".to_string()],
        }
    }

    #[test]
    fn records_and_fails_on_demand() {
        let mailer = RecordingMailer::new();
        mailer.send(&email("a@example.com")).unwrap();
        assert_eq!(mailer.sent_to("A@example.com").len(), 1);

        mailer.set_failing(true);
        assert!(mailer.send(&email("b@example.com")).is_err());
        assert_eq!(mailer.sent().len(), 1);

        mailer.set_failing(false);
        assert!(matches!(
            mailer.send(&email("broken")),
            Err(MailError::InvalidAddress(_))
        ));
    }
}
