//! New-post announcements to verified subscribers.

use crate::background_jobs::HookEvent;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::deliverability::{HeaderEnhancer, Profile};
use crate::mailer::is_valid_email;
use crate::newsletter_store::{
    normalize_email, FullNewsletterStore, NewQueuedEmail,
};
use crate::queue_worker::LAST_BATCH_TIME_KEY;
use crate::server_store::{EmailAction, ServerStore};
use crate::templates::{escape_html, PostView, Templates, RECIPIENT_PLACEHOLDER, UNSUBSCRIBE_PLACEHOLDER};
use crate::unsubscribe::UnsubscribeLinks;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("no valid addresses in the selection")]
    NoValidSelection,
    #[error("no verified subscribers to notify")]
    NoSubscribers,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostNotification {
    pub post_id: i64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub excerpt: String,
    /// Unix timestamp (seconds)
    pub published_at: i64,
    #[serde(default)]
    pub custom_title: Option<String>,
    /// Trusted HTML replacing the excerpt.
    #[serde(default)]
    pub custom_body: Option<String>,
    #[serde(default)]
    pub profile: Option<Profile>,
}

impl PostNotification {
    pub fn display_title(&self) -> &str {
        self.custom_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub queued: usize,
    pub profile: Profile,
}

pub struct BroadcastService {
    store: Arc<dyn FullNewsletterStore>,
    server_store: Arc<dyn ServerStore>,
    clock: Arc<dyn Clock>,
    templates: Templates,
    enhancer: HeaderEnhancer,
    unsubscribe: UnsubscribeLinks,
    subject_template: String,
    default_profile: Profile,
    hook_sender: Option<mpsc::Sender<HookEvent>>,
}

impl BroadcastService {
    pub fn new(
        store: Arc<dyn FullNewsletterStore>,
        server_store: Arc<dyn ServerStore>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
        hook_sender: Option<mpsc::Sender<HookEvent>>,
    ) -> Self {
        Self {
            store,
            server_store,
            clock,
            templates: Templates::new(&config.site),
            enhancer: HeaderEnhancer::from_config(config),
            unsubscribe: UnsubscribeLinks::from_config(config),
            subject_template: config.templates.new_post_subject.clone(),
            default_profile: config.templates.default_broadcast_profile,
            hook_sender,
        }
    }

    fn recipients(&self, selection: Option<&[String]>) -> Result<Vec<String>, BroadcastError> {
        let recipients = match selection {
            Some(selection) => {
                let valid: Vec<String> = selection
                    .iter()
                    .map(|e| normalize_email(e))
                    .filter(|e| is_valid_email(e))
                    .collect();
                if valid.is_empty() {
                    return Err(BroadcastError::NoValidSelection);
                }
                self.store.get_verified_emails(Some(valid.as_slice()))?
            }
            None => self.store.get_verified_emails(None)?,
        };
        if recipients.is_empty() {
            return Err(BroadcastError::NoSubscribers);
        }
        Ok(recipients)
    }

    fn render(
        &self,
        post: &PostNotification,
        subject: &str,
        profile: Profile,
        now: i64,
    ) -> askama::Result<String> {
        match profile {
            Profile::Alert => {
                self.templates
                    .alert_post(subject, post.display_title(), &post.url, now)
            }
            Profile::Newsletter => self.templates.new_post(
                &PostView {
                    title: post.display_title(),
                    url: &post.url,
                    published_at: post.published_at,
                    excerpt: &post.excerpt,
                    custom_html: post.custom_body.as_deref(),
                },
                now,
            ),
        }
    }

    /// Queues one message per recipient and wakes the queue worker.
    pub fn queue_post_notification(
        &self,
        post: &PostNotification,
        selection: Option<&[String]>,
    ) -> Result<BroadcastOutcome, BroadcastError> {
        let recipients = self.recipients(selection)?;
        let now = self.clock.now();
        let profile = post.profile.unwrap_or(self.default_profile);
        let subject = self
            .subject_template
            .replace("{post_title}", post.display_title());
        let body = self
            .render(post, &subject, profile, now)
            .context("rendering the post notification")?;
        let post_ref = format!("post {}", post.post_id);

        let mut queued = 0;
        for email in &recipients {
            let personalized = body
                .replace(UNSUBSCRIBE_PLACEHOLDER, &self.unsubscribe.link(email))
                .replace(RECIPIENT_PLACEHOLDER, &escape_html(email));
            self.store.enqueue(&NewQueuedEmail {
                recipient: email.clone(),
                subject: subject.clone(),
                body: personalized,
                headers: self.enhancer.build_plugin_headers(email, profile.as_str()),
                send_at: now,
            })?;
            self.server_store.log_email_activity(
                email,
                EmailAction::NewPostQueued,
                Some(&post_ref),
                now,
            )?;
            queued += 1;
        }

        if queued > 0 {
            self.server_store.delete_transient(LAST_BATCH_TIME_KEY)?;
            if let Some(sender) = &self.hook_sender {
                if let Err(e) = sender.try_send(HookEvent::OnEmailsQueued) {
                    warn!("Could not wake the queue worker: {}", e);
                }
            }
        }

        info!(
            "Queued {} '{}' notifications for post {}",
            queued, profile, post.post_id
        );
        Ok(BroadcastOutcome { queued, profile })
    }
}
