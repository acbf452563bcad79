//! Signed one-click unsubscribe links.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::newsletter_store::{normalize_email, SubscriberStore};
use crate::server_store::{EmailAction, ServerStore};
use crate::tokens::{hmac_hex, verify_hmac_hex};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UnsubscribeError {
    #[error("invalid unsubscribe token")]
    InvalidToken,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Builds and checks the per-address unsubscribe token.
#[derive(Clone)]
pub struct UnsubscribeLinks {
    site_url: String,
    secret: Vec<u8>,
}

impl UnsubscribeLinks {
    pub fn new(site_url: &str, secret: &[u8]) -> Self {
        Self {
            site_url: site_url.trim_end_matches('/').to_string(),
            secret: secret.to_vec(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.site.url, config.secret_key.as_bytes())
    }

    fn payload(email: &str) -> String {
        format!("unsubscribe|{}", normalize_email(email))
    }

    pub fn token(&self, email: &str) -> String {
        hmac_hex(&self.secret, &Self::payload(email))
    }

    pub fn verify(&self, email: &str, token: &str) -> bool {
        verify_hmac_hex(&self.secret, &Self::payload(email), token)
    }

    pub fn link(&self, email: &str) -> String {
        format!(
            "{}/unsubscribe?email={}&token={}",
            self.site_url,
            urlencoding::encode(&normalize_email(email)),
            self.token(email)
        )
    }
}

pub struct UnsubscribeService {
    subscribers: Arc<dyn SubscriberStore>,
    server_store: Arc<dyn ServerStore>,
    clock: Arc<dyn Clock>,
    links: UnsubscribeLinks,
}

impl UnsubscribeService {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        server_store: Arc<dyn ServerStore>,
        clock: Arc<dyn Clock>,
        links: UnsubscribeLinks,
    ) -> Self {
        Self {
            subscribers,
            server_store,
            clock,
            links,
        }
    }

    pub fn links(&self) -> &UnsubscribeLinks {
        &self.links
    }

    /// Removes the subscriber. Unknown addresses with a valid token succeed.
    pub fn unsubscribe(&self, email: &str, token: &str) -> Result<(), UnsubscribeError> {
        if !self.links.verify(email, token) {
            warn!("Rejected unsubscribe with bad token");
            return Err(UnsubscribeError::InvalidToken);
        }
        let email = normalize_email(email);
        let removed = self.subscribers.delete_subscriber(&email)?;
        if removed {
            info!("Unsubscribed {}", email);
            self.server_store
                .log_email_activity(
                    &email,
                    EmailAction::Unsubscribed,
                    None,
                    self.clock.now(),
                )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::newsletter_store::SqliteNewsletterStore;
    use crate::server_store::SqliteServerStore;

    const SECRET: &[u8] = b"0123456789abcdef";
    const NOW: i64 = 1_700_000_000;

    fn service() -> (UnsubscribeService, Arc<SqliteNewsletterStore>, Arc<SqliteServerStore>) {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let links = UnsubscribeLinks::new("https://news.example.com/", SECRET);
        let clock = Arc::new(ManualClock::new(NOW));
        let service =
            UnsubscribeService::new(store.clone(), server_store.clone(), clock, links);
        (service, store, server_store)
    }

    #[test]
    fn link_carries_encoded_email_and_token() {
        let links = UnsubscribeLinks::new("https://news.example.com/", SECRET);
        let link = links.link("Reader+x@Example.com");
        assert!(link.starts_with(
            "https://news.example.com/unsubscribe?email=reader%2Bx%40example.com&token="
        ));
        assert!(link.ends_with(&links.token("reader+x@example.com")));
    }

    #[test]
    fn token_is_case_insensitive_on_email() {
        let links = UnsubscribeLinks::new("https://news.example.com", SECRET);
        let token = links.token("Reader@Example.com");
        assert!(links.verify("reader@example.com", &token));
        assert!(!links.verify("other@example.com", &token));
    }

    #[test]
    fn unsubscribe_removes_subscriber_and_logs() {
        let (service, store, server_store) = service();
        store.add_or_update_subscriber("a@example.com", Some(true), NOW).unwrap();

        let token = service.links().token("a@example.com");
        service.unsubscribe("A@example.com", &token).unwrap();

        assert!(store.get_subscriber("a@example.com").unwrap().is_none());
        let activity = server_store.get_email_activity(10, 0).unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, "unsubscribed");
        assert_eq!(activity[0].timestamp, NOW);

        // Second click on the same link still succeeds
        service.unsubscribe("a@example.com", &token).unwrap();
    }

    #[test]
    fn bad_token_is_rejected() {
        let (service, store, _) = service();
        store.add_or_update_subscriber("a@example.com", None, NOW).unwrap();
        let result = service.unsubscribe("a@example.com", "deadbeef");
        assert!(matches!(result, Err(UnsubscribeError::InvalidToken)));
        assert!(store.get_subscriber("a@example.com").unwrap().is_some());
    }
}
