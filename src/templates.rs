//! HTML bodies for outgoing mail and the few pages the server renders.
//!
//! Bodies keep the `{unsubscribe_link}` and `{recipient_email}` placeholders
//! in the footer; the queue worker and broadcaster fill them per recipient.

use crate::config::SiteSettings;
use askama::Template;
use chrono::{DateTime, Datelike, TimeZone, Utc};

pub const UNSUBSCRIBE_PLACEHOLDER: &str = "{unsubscribe_link}";
pub const RECIPIENT_PLACEHOLDER: &str = "{recipient_email}";

#[derive(Template)]
#[template(source = "{{ text }}", ext = "html")]
struct EscapedText<'a> {
    text: &'a str,
}

/// Escapes a value spliced into an already rendered body.
pub fn escape_html(text: &str) -> String {
    EscapedText { text }.to_string()
}

fn datetime(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn format_date(timestamp: i64) -> String {
    datetime(timestamp).format("%B %-d, %Y").to_string()
}

#[derive(Template)]
#[template(path = "email/layout.html")]
struct EmailLayout<'a> {
    site_name: &'a str,
    site_url: &'a str,
    domain: &'a str,
    preheader: &'a str,
    content: &'a str,
    year: i32,
    recipient_placeholder: &'a str,
    unsubscribe_placeholder: &'a str,
}

#[derive(Template)]
#[template(path = "email/newsletter.html")]
struct NewsletterContent<'a> {
    subject: &'a str,
    date: String,
    content: &'a str,
}

#[derive(Template)]
#[template(path = "email/alert_post.html")]
struct AlertPostContent<'a> {
    title: &'a str,
    url: &'a str,
}

#[derive(Template)]
#[template(path = "email/subscribe_verification.html")]
struct SubscribeVerificationContent<'a> {
    site_name: &'a str,
    button_url: &'a str,
    button_label: &'a str,
}

#[derive(Template)]
#[template(path = "email/download.html")]
struct DownloadContent<'a> {
    lines: Vec<&'a str>,
}

#[derive(Template)]
#[template(path = "email/download_verification.html")]
struct DownloadVerificationContent<'a> {
    file_name: &'a str,
    button_url: &'a str,
    button_label: &'a str,
}

#[derive(Template)]
#[template(path = "email/new_post.html")]
struct NewPostContent<'a> {
    title: &'a str,
    date: String,
    excerpt: &'a str,
    custom_html: Option<&'a str>,
    button_url: &'a str,
    button_label: &'a str,
}

#[derive(Template)]
#[template(path = "pages/notice.html")]
struct NoticePage<'a> {
    site_name: &'a str,
    headline: &'a str,
    message: &'a str,
    show_button: bool,
    button_url: &'a str,
    button_label: &'a str,
}

/// A post announced to subscribers.
#[derive(Debug, Clone)]
pub struct PostView<'a> {
    pub title: &'a str,
    pub url: &'a str,
    pub published_at: i64,
    pub excerpt: &'a str,
    /// Trusted HTML written by an admin, inserted as is.
    pub custom_html: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Templates {
    site_name: String,
    site_url: String,
    domain: String,
}

impl Templates {
    pub fn new(site: &SiteSettings) -> Self {
        Self {
            site_name: site.name.clone(),
            site_url: site.url.clone(),
            domain: site.domain(),
        }
    }

    /// Full document with preheader and the standard footer.
    pub fn wrap(&self, preheader: &str, content: &str, now: i64) -> askama::Result<String> {
        EmailLayout {
            site_name: &self.site_name,
            site_url: &self.site_url,
            domain: &self.domain,
            preheader,
            content,
            year: datetime(now).year(),
            recipient_placeholder: RECIPIENT_PLACEHOLDER,
            unsubscribe_placeholder: UNSUBSCRIBE_PLACEHOLDER,
        }
        .render()
    }

    /// Generic titled message with the send date under the title.
    pub fn newsletter(&self, subject: &str, content_html: &str, now: i64) -> askama::Result<String> {
        let content = NewsletterContent {
            subject,
            date: format_date(now),
            content: content_html,
        }
        .render()?;
        self.wrap(subject, &content, now)
    }

    pub fn subscribe_verification(&self, verify_link: &str, now: i64) -> askama::Result<String> {
        let content = SubscribeVerificationContent {
            site_name: &self.site_name,
            button_url: verify_link,
            button_label: "Confirm Subscription",
        }
        .render()?;
        self.wrap("Please confirm your subscription", &content, now)
    }

    /// `body_text` is plain text from the config, already link-substituted.
    pub fn download(&self, body_text: &str, now: i64) -> askama::Result<String> {
        let content = DownloadContent {
            lines: body_text.lines().collect(),
        }
        .render()?;
        self.wrap("Your download link is inside", &content, now)
    }

    pub fn download_verification(
        &self,
        file_name: &str,
        verify_link: &str,
        now: i64,
    ) -> askama::Result<String> {
        let content = DownloadVerificationContent {
            file_name,
            button_url: verify_link,
            button_label: "Verify Email",
        }
        .render()?;
        self.wrap("Confirm your email to get your download", &content, now)
    }

    pub fn new_post(&self, post: &PostView<'_>, now: i64) -> askama::Result<String> {
        let content = NewPostContent {
            title: post.title,
            date: format_date(post.published_at),
            excerpt: post.excerpt,
            custom_html: post.custom_html.filter(|html| !html.trim().is_empty()),
            button_url: post.url,
            button_label: "Read Article",
        }
        .render()?;
        self.wrap(post.title, &content, now)
    }

    /// Minimal notice used for the alert profile.
    pub fn alert_post(
        &self,
        subject: &str,
        title: &str,
        url: &str,
        now: i64,
    ) -> askama::Result<String> {
        let content = AlertPostContent { title, url }.render()?;
        self.newsletter(subject, &content, now)
    }

    /// Standalone page for browser-facing results.
    pub fn page(
        &self,
        headline: &str,
        message: &str,
        button_link: Option<(&str, &str)>,
    ) -> askama::Result<String> {
        let (button_url, button_label) = button_link.unwrap_or_default();
        NoticePage {
            site_name: &self.site_name,
            headline,
            message,
            show_button: button_link.is_some(),
            button_url,
            button_label,
        }
        .render()
    }
}
