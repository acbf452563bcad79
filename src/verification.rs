//! Double opt-in for new subscribers.
//!
//! Tokens are HMAC digests kept in a transient per address, so a new request
//! replaces the previous token and a successful check consumes it.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::deliverability::HeaderEnhancer;
use crate::mailer::is_valid_email;
use crate::newsletter_store::{
    normalize_email, FullNewsletterStore, NewQueuedEmail,
};
use crate::server_store::{EmailAction, ServerStore};
use crate::templates::{Templates, RECIPIENT_PLACEHOLDER, UNSUBSCRIBE_PLACEHOLDER};
use crate::tokens::{constant_time_eq, email_key, hmac_hex, random_nonce};
use crate::unsubscribe::UnsubscribeLinks;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60 * 60;
pub const MAX_ATTEMPTS_PER_WINDOW: u32 = 3;
pub const RESEND_DEBOUNCE_SECS: i64 = 5 * 60;
const TOKEN_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success,
    Invalid,
    RateLimited,
}

impl VerificationOutcome {
    /// Value of the `verified` query parameter on the redirect.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationOutcome::Success => "success",
            VerificationOutcome::Invalid => "invalid",
            VerificationOutcome::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    AlreadySubscribed,
    VerificationSent,
    /// A verification email went out less than five minutes ago.
    VerificationPending,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires: i64,
}

fn token_key(email: &str) -> String {
    format!("verify_token_{}", email_key(email))
}

fn rate_key(email: &str) -> String {
    format!("verify_rate_{}", email_key(email))
}

fn sent_key(email: &str) -> String {
    format!("verify_email_sent_{}", email_key(email))
}

pub struct VerificationService {
    store: Arc<dyn FullNewsletterStore>,
    server_store: Arc<dyn ServerStore>,
    clock: Arc<dyn Clock>,
    templates: Templates,
    enhancer: HeaderEnhancer,
    unsubscribe: UnsubscribeLinks,
    secret: Vec<u8>,
    site_url: String,
    subject: String,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn FullNewsletterStore>,
        server_store: Arc<dyn ServerStore>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            server_store,
            clock,
            templates: Templates::new(&config.site),
            enhancer: HeaderEnhancer::from_config(config),
            unsubscribe: UnsubscribeLinks::from_config(config),
            secret: config.secret_key.as_bytes().to_vec(),
            site_url: config.site.url.clone(),
            subject: config.templates.subscribe_subject.clone(),
        }
    }

    /// Issues a fresh token for the address, replacing any previous one.
    pub fn generate_token(&self, email: &str) -> anyhow::Result<String> {
        let email = normalize_email(email);
        let now = self.clock.now();
        let token = hmac_hex(
            &self.secret,
            &format!("{}|{}|{}", email, now, random_nonce()),
        );
        let stored = StoredToken {
            token: token.clone(),
            expires: now + TOKEN_TTL_SECS,
        };
        self.server_store.set_transient(
            &token_key(&email),
            &serde_json::to_string(&stored)?,
            TOKEN_TTL_SECS,
            now,
        )?;
        Ok(token)
    }

    /// Checks and consumes the token. Only unverified subscribers qualify.
    pub fn verify_token(&self, email: &str, token: &str) -> anyhow::Result<bool> {
        let email = normalize_email(email);
        if !is_valid_email(&email) || token.len() != TOKEN_LEN {
            return Ok(false);
        }
        match self.store.get_subscriber(&email)? {
            Some(subscriber) if !subscriber.verified => {}
            _ => return Ok(false),
        }

        let now = self.clock.now();
        let key = token_key(&email);
        let Some(raw) = self.server_store.get_transient(&key, now)? else {
            return Ok(false);
        };
        let stored: StoredToken = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Dropping unreadable verification token: {}", e);
                self.server_store.delete_transient(&key)?;
                return Ok(false);
            }
        };

        if !constant_time_eq(&stored.token, token) {
            return Ok(false);
        }
        self.server_store.delete_transient(&key)?;
        if stored.expires < now {
            debug!("Verification token for {} expired", email);
            return Ok(false);
        }
        Ok(true)
    }

    /// Counts an attempt. Returns false once the hourly allowance is used up.
    pub fn check_rate_limit(&self, email: &str) -> anyhow::Result<bool> {
        let key = rate_key(email);
        let now = self.clock.now();
        let attempts = self
            .server_store
            .get_transient(&key, now)?
            .and_then(|v| v.parse::<u32>().ok());
        match attempts {
            None => {
                self.server_store
                    .set_transient(&key, "1", RATE_LIMIT_WINDOW_SECS, now)?;
                Ok(true)
            }
            Some(n) if n >= MAX_ATTEMPTS_PER_WINDOW => Ok(false),
            Some(n) => {
                self.server_store.set_transient(
                    &key,
                    &(n + 1).to_string(),
                    RATE_LIMIT_WINDOW_SECS,
                    now,
                )?;
                Ok(true)
            }
        }
    }

    pub fn handle_verification_request(
        &self,
        email: &str,
        token: &str,
    ) -> anyhow::Result<VerificationOutcome> {
        let email = normalize_email(email);
        // Malformed links never count against the attempt allowance
        if !is_valid_email(&email) || token.len() != TOKEN_LEN {
            return Ok(VerificationOutcome::Invalid);
        }
        if !self.check_rate_limit(&email)? {
            warn!("Verification rate limit hit for {}", email);
            return Ok(VerificationOutcome::RateLimited);
        }
        if !self.verify_token(&email, token)? {
            return Ok(VerificationOutcome::Invalid);
        }
        self.store.mark_verified(&email)?;
        self.server_store.log_email_activity(
            &email,
            EmailAction::SubscriptionVerified,
            None,
            self.clock.now(),
        )?;
        info!("Subscriber {} verified", email);
        Ok(VerificationOutcome::Success)
    }

    pub fn verification_link(&self, email: &str, token: &str) -> String {
        format!(
            "{}/verify?verify_email={}&token={}",
            self.site_url,
            urlencoding::encode(email),
            token
        )
    }

    /// Queues the confirmation email. Returns false when one was queued
    /// within the debounce window.
    pub fn send_verification_email(&self, email: &str) -> Result<bool, VerificationError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(VerificationError::InvalidEmail);
        }
        let now = self.clock.now();
        let debounce_key = sent_key(&email);
        if self.server_store.get_transient(&debounce_key, now)?.is_some() {
            debug!("Verification email to {} already queued recently", email);
            return Ok(false);
        }

        let token = self.generate_token(&email)?;
        let link = self.verification_link(&email, &token);
        let body = self
            .templates
            .subscribe_verification(&link, now)
            .context("rendering the verification email")?
            .replace(UNSUBSCRIBE_PLACEHOLDER, &self.unsubscribe.link(&email))
            .replace(RECIPIENT_PLACEHOLDER, &email);

        self.store.enqueue(&NewQueuedEmail {
            recipient: email.clone(),
            subject: self.subject.clone(),
            body,
            headers: self.enhancer.build_plugin_headers(&email, "verify"),
            send_at: now,
        })?;
        self.server_store
            .set_transient(&debounce_key, "1", RESEND_DEBOUNCE_SECS, now)?;
        self.server_store
            .log_email_activity(&email, EmailAction::VerificationQueued, None, now)?;
        info!("Queued verification email for {}", email);
        Ok(true)
    }

    pub fn subscribe(&self, email: &str) -> Result<SubscribeOutcome, VerificationError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(VerificationError::InvalidEmail);
        }
        let subscriber = self
            .store
            .add_or_update_subscriber(&email, None, self.clock.now())?;
        if subscriber.verified {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if self.send_verification_email(&email)? {
            Ok(SubscribeOutcome::VerificationSent)
        } else {
            Ok(SubscribeOutcome::VerificationPending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::newsletter_store::{
        EmailQueueStore, QueueFilter, SqliteNewsletterStore, SubscriberStore,
    };
    use crate::server_store::SqliteServerStore;
    use std::path::PathBuf;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        service: VerificationService,
        store: Arc<SqliteNewsletterStore>,
        server_store: Arc<SqliteServerStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(NOW));
        let mut config = AppConfig::with_defaults(PathBuf::from("."), "0123456789abcdef");
        config.site.url = "https://news.example.com".to_string();
        let service =
            VerificationService::new(store.clone(), server_store.clone(), clock.clone(), &config);
        Fixture {
            service,
            store,
            server_store,
            clock,
        }
    }

    #[test]
    fn subscribe_queues_verification_email() {
        let f = fixture();
        let outcome = f.service.subscribe("Reader@Example.com").unwrap();
        assert_eq!(outcome, SubscribeOutcome::VerificationSent);

        let subscriber = f.store.get_subscriber("reader@example.com").unwrap().unwrap();
        assert!(!subscriber.verified);

        let queued = f.store.list_queue(&QueueFilter::default()).unwrap();
        assert_eq!(queued.len(), 1);
        let email = &queued[0];
        assert_eq!(email.recipient, "reader@example.com");
        assert_eq!(email.subject, "Confirm Your Subscription");
        assert_eq!(email.send_at, NOW);
        assert!(email.headers.contains(&"X-WNS: verify".to_string()));
        assert!(email
            .body
            .contains("https://news.example.com/verify?verify_email=reader%40example.com&amp;token="));
        assert!(email.body.contains("Confirm Subscription"));
        assert!(email.body.contains("/unsubscribe?email=reader%40example.com"));
        assert!(!email.body.contains(UNSUBSCRIBE_PLACEHOLDER));
    }

    #[test]
    fn repeated_subscribe_is_debounced() {
        let f = fixture();
        f.service.subscribe("a@example.com").unwrap();
        assert_eq!(
            f.service.subscribe("a@example.com").unwrap(),
            SubscribeOutcome::VerificationPending
        );
        assert_eq!(f.store.count_queue(None).unwrap(), 1);

        f.clock.advance(RESEND_DEBOUNCE_SECS + 1);
        assert_eq!(
            f.service.subscribe("a@example.com").unwrap(),
            SubscribeOutcome::VerificationSent
        );
        assert_eq!(f.store.count_queue(None).unwrap(), 2);
    }

    #[test]
    fn verified_subscriber_is_not_mailed() {
        let f = fixture();
        f.store.add_or_update_subscriber("a@example.com", Some(true), NOW).unwrap();
        assert_eq!(
            f.service.subscribe("a@example.com").unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(f.store.count_queue(None).unwrap(), 0);
    }

    #[test]
    fn invalid_email_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.service.subscribe("nope"),
            Err(VerificationError::InvalidEmail)
        ));
    }

    #[test]
    fn token_is_single_use() {
        let f = fixture();
        f.store.add_or_update_subscriber("a@example.com", None, NOW).unwrap();
        let token = f.service.generate_token("a@example.com").unwrap();
        assert_eq!(token.len(), 64);

        assert_eq!(
            f.service.handle_verification_request("a@example.com", &token).unwrap(),
            VerificationOutcome::Success
        );
        assert!(f.store.is_subscriber_verified("a@example.com").unwrap());
        assert!(!f.service.verify_token("a@example.com", &token).unwrap());

        let activity = f.server_store.get_email_activity(10, 0).unwrap();
        assert_eq!(activity[0].action, "subscription_verified");
        assert_eq!(activity[0].timestamp, NOW);
    }

    #[test]
    fn newer_token_replaces_older() {
        let f = fixture();
        f.store.add_or_update_subscriber("a@example.com", None, NOW).unwrap();
        let first = f.service.generate_token("a@example.com").unwrap();
        let second = f.service.generate_token("a@example.com").unwrap();
        assert_ne!(first, second);
        assert!(!f.service.verify_token("a@example.com", &first).unwrap());
        assert!(f.service.verify_token("a@example.com", &second).unwrap());
    }

    #[test]
    fn expired_token_is_invalid() {
        let f = fixture();
        f.store.add_or_update_subscriber("a@example.com", None, NOW).unwrap();
        let token = f.service.generate_token("a@example.com").unwrap();
        f.clock.advance(TOKEN_TTL_SECS + 1);
        assert!(!f.service.verify_token("a@example.com", &token).unwrap());
    }

    #[test]
    fn token_requires_unverified_subscriber_and_exact_shape() {
        let f = fixture();
        let token = f.service.generate_token("ghost@example.com").unwrap();
        assert!(!f.service.verify_token("ghost@example.com", &token).unwrap());

        f.store.add_or_update_subscriber("a@example.com", Some(true), NOW).unwrap();
        let token = f.service.generate_token("a@example.com").unwrap();
        assert!(!f.service.verify_token("a@example.com", &token).unwrap());

        f.store.add_or_update_subscriber("b@example.com", None, NOW).unwrap();
        f.service.generate_token("b@example.com").unwrap();
        assert!(!f.service.verify_token("b@example.com", "short").unwrap());
    }

    #[test]
    fn rate_limit_allows_three_attempts_per_hour() {
        let f = fixture();
        let bogus = "0".repeat(64);
        for _ in 0..3 {
            assert_eq!(
                f.service.handle_verification_request("a@example.com", &bogus).unwrap(),
                VerificationOutcome::Invalid
            );
        }
        assert_eq!(
            f.service.handle_verification_request("a@example.com", &bogus).unwrap(),
            VerificationOutcome::RateLimited
        );

        f.clock.advance(RATE_LIMIT_WINDOW_SECS + 1);
        assert_eq!(
            f.service.handle_verification_request("a@example.com", &bogus).unwrap(),
            VerificationOutcome::Invalid
        );
    }

    #[test]
    fn malformed_request_is_invalid_without_counting() {
        let f = fixture();
        assert_eq!(
            f.service.handle_verification_request("not-an-email", "x").unwrap(),
            VerificationOutcome::Invalid
        );
        assert_eq!(
            f.service.handle_verification_request("a@example.com", "").unwrap(),
            VerificationOutcome::Invalid
        );
        assert!(f.service.check_rate_limit("a@example.com").unwrap());
    }

    #[test]
    fn truncated_links_do_not_lock_out_the_real_one() {
        let f = fixture();
        f.store.add_or_update_subscriber("a@example.com", None, NOW).unwrap();
        let token = f.service.generate_token("a@example.com").unwrap();

        for truncated in ["abc", &token[..32], &token[..63]] {
            assert_eq!(
                f.service.handle_verification_request("a@example.com", truncated).unwrap(),
                VerificationOutcome::Invalid
            );
        }
        assert_eq!(
            f.service.handle_verification_request("a@example.com", &token).unwrap(),
            VerificationOutcome::Success
        );
    }
}
