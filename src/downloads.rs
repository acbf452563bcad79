//! Email-gated file downloads.
//!
//! A visitor submits an address for a file; the server mails a single-use,
//! 24 hour link (or a verification link first when downloads require a
//! verified address). Redeeming the link marks the token used and redirects
//! to the file.

use crate::clock::Clock;
use crate::config::{AppConfig, DownloadSettings};
use crate::deliverability::{track_email_failure, track_email_success, HeaderEnhancer};
use crate::mailer::{is_valid_email, MailError, Mailer, OutgoingEmail};
use crate::newsletter_store::{
    normalize_email, DownloadToken, FullNewsletterStore, NewDownloadToken,
};
use crate::server::metrics;
use crate::server_store::{EmailAction, ServerStore};
use crate::templates::{escape_html, Templates, RECIPIENT_PLACEHOLDER, UNSUBSCRIBE_PLACEHOLDER};
use crate::tokens::{email_key, random_alphanumeric};
use crate::unsubscribe::UnsubscribeLinks;
use anyhow::Context;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DOWNLOAD_TOKEN_LEN: usize = 32;
pub const DOWNLOAD_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
/// Expired rows are kept this long before cleanup removes them.
pub const EXPIRED_TOKEN_RETENTION_SECS: i64 = 48 * 60 * 60;
const REQUEST_LOCK_SECS: i64 = 60;
const VERIFY_MAIL_LOCK_SECS: i64 = 120;
const VERIFICATION_SUBJECT: &str = "Verify Your Email to Download File";
const DOWNLOAD_MARKER: &str = "alert";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid email address.")]
    InvalidEmail,
    #[error("Download is not available yet.")]
    NotAvailable,
    #[error("Download link has expired or is invalid.")]
    InvalidLink,
    #[error("Download link has expired, is invalid, or email verification is required.")]
    InvalidOrUnverifiedLink,
    #[error("We couldn’t send the email right now. Please try again in a moment.")]
    Mail(#[from] MailError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRequestOutcome {
    /// Download link mailed.
    Sent,
    /// Verification link mailed instead of the file.
    VerificationSent,
    /// Verified subscriber, nothing mailed.
    Skipped,
    /// Same request within the last minute, nothing mailed.
    AlreadyRequested,
}

impl DownloadRequestOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            DownloadRequestOutcome::Skipped => {
                "You’re verified! You can now download instantly (no email needed)."
            }
            _ => "Please check your email for the link.\nIf you’re verifying for the first time, click the verification email first.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadVerifyOutcome {
    Verified,
    AlreadyVerified,
    /// Another click on the same link is still being handled.
    InProgress,
}

fn is_http_url(url: &str) -> bool {
    Url::parse(url.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

/// Last path segment of the URL, without query or fragment.
fn file_name_from_url(url: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|name| {
            urlencoding::decode(&name)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(name)
        })
        .unwrap_or_default()
}

pub struct DownloadService {
    store: Arc<dyn FullNewsletterStore>,
    server_store: Arc<dyn ServerStore>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    settings: DownloadSettings,
    templates: Templates,
    enhancer: HeaderEnhancer,
    unsubscribe: UnsubscribeLinks,
    site_url: String,
}

impl DownloadService {
    pub fn new(
        store: Arc<dyn FullNewsletterStore>,
        server_store: Arc<dyn ServerStore>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            server_store,
            mailer,
            clock,
            settings: config.downloads.clone(),
            templates: Templates::new(&config.site),
            enhancer: HeaderEnhancer::from_config(config),
            unsubscribe: UnsubscribeLinks::from_config(config),
            site_url: config.site.url.clone(),
        }
    }

    /// Finds the file behind a download form.
    ///
    /// A submitted URL wins when passthrough is enabled. Otherwise the
    /// configured files are searched for the exact block, then for any
    /// entry of the post.
    pub fn resolve_file_url(
        &self,
        post_id: i64,
        block_id: Option<&str>,
        submitted: Option<&str>,
    ) -> Option<String> {
        if self.settings.allow_file_url_passthrough {
            if let Some(url) = submitted.map(str::trim).filter(|u| is_http_url(u)) {
                return Some(url.to_string());
            }
        }
        let block_id = block_id.filter(|b| !b.is_empty());
        let files = &self.settings.files;
        files
            .iter()
            .find(|f| f.post_id == post_id && f.block_id.as_deref() == block_id)
            .or_else(|| files.iter().find(|f| f.post_id == post_id))
            .map(|f| f.file_url.clone())
    }

    pub fn generate_download_token(
        &self,
        email: &str,
        file_url: &str,
        post_id: i64,
        block_id: &str,
    ) -> anyhow::Result<String> {
        let now = self.clock.now();
        let token = random_alphanumeric(DOWNLOAD_TOKEN_LEN);
        self.store.insert_download_token(&NewDownloadToken {
            email: normalize_email(email),
            token: token.clone(),
            file_url: file_url.to_string(),
            post_id,
            block_id: block_id.to_string(),
            created_at: now,
            expires_at: now + DOWNLOAD_TOKEN_TTL_SECS,
            verified: !self.settings.require_verification,
        })?;
        Ok(token)
    }

    fn token_query(token: &str, email: &str) -> String {
        format!("token={}&email={}", token, urlencoding::encode(email))
    }

    pub fn download_link(&self, token: &str, email: &str) -> String {
        format!("{}/download?{}", self.site_url, Self::token_query(token, email))
    }

    pub fn download_verification_link(&self, token: &str, email: &str) -> String {
        format!(
            "{}/download/verify?{}",
            self.site_url,
            Self::token_query(token, email)
        )
    }

    fn personalize(&self, html: String, email: &str) -> String {
        html.replace(UNSUBSCRIBE_PLACEHOLDER, &self.unsubscribe.link(email))
            .replace(RECIPIENT_PLACEHOLDER, &escape_html(email))
    }

    /// Sends outside the queue. Every attempt feeds the email stats the
    /// batch sizing reads.
    fn send_alert(
        &self,
        email: &str,
        subject: &str,
        html_body: String,
    ) -> Result<(), DownloadError> {
        let result = self.mailer.send(&OutgoingEmail {
            to: email.to_string(),
            subject: subject.to_string(),
            html_body: self.personalize(html_body, email),
            headers: self.enhancer.build_plugin_headers(email, DOWNLOAD_MARKER),
        });
        match result {
            Ok(()) => {
                metrics::record_email_delivery("sent");
                track_email_success(&*self.server_store)?;
                Ok(())
            }
            Err(e) => {
                metrics::record_email_delivery("failed");
                warn!("Failed to send download email to {}: {}", email, e);
                track_email_failure(&*self.server_store)?;
                Err(e.into())
            }
        }
    }

    fn send_download_email(&self, email: &str, token: &str) -> Result<(), DownloadError> {
        let link = self.download_link(token, email);
        let body_text = self.settings.email_body.replace("{download_link}", &link);
        let html = self
            .templates
            .download(&body_text, self.clock.now())
            .context("rendering the download email")?;
        self.send_alert(email, &self.settings.email_subject, html)
    }

    fn send_download_verification_email(
        &self,
        email: &str,
        token: &str,
        file_url: &str,
    ) -> Result<(), DownloadError> {
        let link = self.download_verification_link(token, email);
        let html = self
            .templates
            .download_verification(&file_name_from_url(file_url), &link, self.clock.now())
            .context("rendering the download verification email")?;
        self.send_alert(email, VERIFICATION_SUBJECT, html)
    }

    pub fn request_download(
        &self,
        email: &str,
        post_id: i64,
        block_id: Option<&str>,
        submitted_url: Option<&str>,
    ) -> Result<DownloadRequestOutcome, DownloadError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(DownloadError::InvalidEmail);
        }
        let file_url = self
            .resolve_file_url(post_id, block_id, submitted_url)
            .ok_or(DownloadError::NotAvailable)?;
        let block_id = block_id.unwrap_or("");

        let outcome = self.send_for_request(&email, &file_url, post_id, block_id);
        // The address is recorded even when the mail could not be sent
        self.store
            .add_or_update_subscriber(&email, None, self.clock.now())?;
        outcome
    }

    fn send_for_request(
        &self,
        email: &str,
        file_url: &str,
        post_id: i64,
        block_id: &str,
    ) -> Result<DownloadRequestOutcome, DownloadError> {
        let now = self.clock.now();
        let lock_key = format!(
            "dl_lock_{}",
            email_key(&format!("{}|{}|{}", email, post_id, block_id))
        );
        if self.server_store.get_transient(&lock_key, now)?.is_some() {
            debug!("Duplicate download request from {} ignored", email);
            return Ok(DownloadRequestOutcome::AlreadyRequested);
        }
        self.server_store
            .set_transient(&lock_key, "1", REQUEST_LOCK_SECS, now)?;

        let require = self.settings.require_verification;
        let verified = self.store.is_subscriber_verified(email)?;
        if require && verified && self.settings.skip_verification_for_verified {
            return Ok(DownloadRequestOutcome::Skipped);
        }

        let token = self.generate_download_token(email, file_url, post_id, block_id)?;
        self.server_store.log_email_activity(
            email,
            EmailAction::DownloadRequested,
            Some(file_url),
            now,
        )?;

        if require && !verified {
            self.send_download_verification_email(email, &token, file_url)?;
            info!("Sent download verification email to {}", email);
            Ok(DownloadRequestOutcome::VerificationSent)
        } else {
            self.send_download_email(email, &token)?;
            info!("Sent download link to {}", email);
            Ok(DownloadRequestOutcome::Sent)
        }
    }

    fn active_token(&self, token: &str, email: &str) -> anyhow::Result<Option<DownloadToken>> {
        let email = normalize_email(email);
        if token.is_empty() || !is_valid_email(&email) {
            return Ok(None);
        }
        self.store
            .find_active_download_token(token, &email, self.clock.now())
    }

    /// Confirms the address behind a download verification link and mails
    /// the actual download link.
    pub fn verify_download(
        &self,
        token: &str,
        email: &str,
    ) -> Result<DownloadVerifyOutcome, DownloadError> {
        let row = self
            .active_token(token, email)?
            .ok_or(DownloadError::InvalidLink)?;
        if row.verified {
            return Ok(DownloadVerifyOutcome::AlreadyVerified);
        }

        let now = self.clock.now();
        let lock_key = format!("dl_verify_mail_{}", row.token);
        if self.server_store.get_transient(&lock_key, now)?.is_some() {
            return Ok(DownloadVerifyOutcome::InProgress);
        }
        self.server_store
            .set_transient(&lock_key, "1", VERIFY_MAIL_LOCK_SECS, now)?;

        self.store
            .add_or_update_subscriber(&row.email, Some(true), now)?;
        self.store.mark_download_token_verified(row.id)?;
        self.send_download_email(&row.email, &row.token)?;
        self.server_store.log_email_activity(
            &row.email,
            EmailAction::DownloadVerified,
            Some(&row.file_url),
            now,
        )?;
        info!("Download verified for {}", row.email);
        Ok(DownloadVerifyOutcome::Verified)
    }

    /// Consumes the token and returns the file URL to redirect to.
    pub fn redeem_download(&self, token: &str, email: &str) -> Result<String, DownloadError> {
        let invalid = || {
            if self.settings.require_verification {
                DownloadError::InvalidOrUnverifiedLink
            } else {
                DownloadError::InvalidLink
            }
        };
        let row = self.active_token(token, email)?.ok_or_else(invalid)?;
        if self.settings.require_verification && !row.verified {
            return Err(invalid());
        }
        if !self.store.mark_download_token_used(row.id)? {
            warn!("Download token {} was redeemed concurrently", row.id);
            return Err(invalid());
        }
        self.server_store.log_email_activity(
            &row.email,
            EmailAction::DownloadRedeemed,
            Some(&row.file_url),
            self.clock.now(),
        )?;
        Ok(row.file_url)
    }

    /// Deletes tokens that expired more than 48 hours before `now`.
    pub fn cleanup_expired_tokens(&self, now: i64) -> anyhow::Result<usize> {
        self.store
            .delete_download_tokens_expired_before(now - EXPIRED_TOKEN_RETENTION_SECS)
    }
}
