use super::Profile;
use crate::config::{AppConfig, MailSettings, SiteSettings};
use crate::unsubscribe::UnsubscribeLinks;
use lazy_static::lazy_static;
use regex::Regex;

pub const MARKER_HEADER: &str = "X-WNS";
pub const DEFAULT_MARKER: &str = "newsletter";

const ALERT_MARKERS: &[&str] = &["alert", "verify", "download", "transactional"];
const NEWSLETTER_MARKERS: &[&str] = &["newsletter", "broadcast", "digest"];

/// Headers appended by [`HeaderEnhancer::enhance`]. Incoming copies are dropped.
const REGENERATED_HEADERS: &[&str] = &["from", "reply-to", "mime-version", "x-mailer", "x-wns-profile"];

lazy_static! {
    static ref MARKER_RE: Regex = Regex::new(r"(?i)^\s*X-WNS:\s*(\S+)").unwrap();
    static ref MARKETING_HEADER_RE: Regex = Regex::new(
        r"(?i)^X-(Newsletter|Email|Message|Content|Campaign|Google-Appengine|Entity|Mailer-LID|Message-Flag|Content-Category|Email-Type-Id)\b"
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerClass {
    Alert,
    Newsletter,
    /// Unknown marker: neither the alert cleanup nor the list headers apply.
    Other,
}

pub fn classify_marker(marker: &str) -> MarkerClass {
    if ALERT_MARKERS.contains(&marker) {
        MarkerClass::Alert
    } else if NEWSLETTER_MARKERS.contains(&marker) {
        MarkerClass::Newsletter
    } else {
        MarkerClass::Other
    }
}

/// Lower-cased first token of the first `X-WNS` header, `newsletter` if none.
pub fn parse_marker(headers: &[String]) -> String {
    headers
        .iter()
        .find_map(|h| MARKER_RE.captures(h).map(|c| c[1].to_lowercase()))
        .unwrap_or_else(|| DEFAULT_MARKER.to_string())
}

fn header_name(line: &str) -> Option<&str> {
    line.split_once(':').map(|(name, _)| name.trim())
}

fn is_list_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("list-") || name == "precedence" || name == "auto-submitted"
}

/// Rewrites outgoing headers for the sender identity and the message profile.
#[derive(Clone)]
pub struct HeaderEnhancer {
    sender_email: String,
    sender_name: String,
    site_name: String,
    site_url: String,
    site_domain: String,
    unsubscribe: UnsubscribeLinks,
}

impl HeaderEnhancer {
    pub fn new(site: &SiteSettings, mail: &MailSettings, unsubscribe: UnsubscribeLinks) -> Self {
        Self {
            sender_email: mail.sender_email.clone(),
            sender_name: mail.sender_name.clone(),
            site_name: site.name.clone(),
            site_url: site.url.clone(),
            site_domain: site.domain(),
            unsubscribe,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.site,
            &config.mail,
            UnsubscribeLinks::from_config(config),
        )
    }

    pub fn sender_email(&self) -> &str {
        &self.sender_email
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn site_domain(&self) -> &str {
        &self.site_domain
    }

    fn list_headers(&self, recipient: &str) -> Vec<String> {
        vec![
            format!(
                "List-ID: {} Newsletter <newsletter.{}>",
                self.site_name, self.site_domain
            ),
            format!("List-Unsubscribe: <{}>", self.unsubscribe.link(recipient)),
            "List-Unsubscribe-Post: List-Unsubscribe=One-Click".to_string(),
            format!("List-Archive: <{}>", self.site_url),
            format!("List-Owner: <mailto:{}>", self.sender_email),
            format!("List-Subscribe: <{}>", self.site_url),
            "Precedence: bulk".to_string(),
            "Auto-Submitted: auto-generated".to_string(),
        ]
    }

    /// Base headers attached when a message is queued.
    pub fn build_plugin_headers(&self, email: &str, marker: &str) -> Vec<String> {
        let mut headers = vec![
            "Content-Type: text/html; charset=UTF-8".to_string(),
            format!("{}: {}", MARKER_HEADER, marker),
            format!("X-Plugin: {}", env!("CARGO_PKG_NAME")),
        ];
        if marker == Profile::Newsletter.as_str() {
            headers.extend(self.list_headers(email));
        }
        headers
    }

    /// Headers for queue rows stored without any.
    pub fn standard_headers(&self, email: &str) -> Vec<String> {
        self.build_plugin_headers(email, DEFAULT_MARKER)
    }

    pub fn enhance(&self, headers: &[String], recipient: &str) -> Vec<String> {
        let marker = parse_marker(headers);
        let class = classify_marker(&marker);

        let mut cleaned = Vec::with_capacity(headers.len());
        let mut has_content_type = false;
        for line in headers {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(name) = header_name(line) else {
                continue;
            };
            let lower = name.to_ascii_lowercase();

            if lower == "content-type" {
                if !has_content_type {
                    cleaned.push(line.to_string());
                    has_content_type = true;
                }
                continue;
            }
            if lower == "return-path" || REGENERATED_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if class == MarkerClass::Alert && MARKETING_HEADER_RE.is_match(line) {
                continue;
            }
            // List headers are regenerated for newsletters and forbidden otherwise
            if is_list_header(name) {
                continue;
            }
            cleaned.push(line.to_string());
        }

        let profile = if class == MarkerClass::Alert {
            Profile::Alert
        } else {
            Profile::Newsletter
        };

        cleaned.push(format!("From: {} <{}>", self.sender_name, self.sender_email));
        cleaned.push(format!("Reply-To: {}", self.sender_email));
        if !has_content_type {
            cleaned.push("Content-Type: text/html; charset=UTF-8".to_string());
        }
        cleaned.push("MIME-Version: 1.0".to_string());
        cleaned.push(format!(
            "X-Mailer: {}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ));
        cleaned.push(format!("X-WNS-Profile: {}", profile));

        if class == MarkerClass::Newsletter {
            cleaned.extend(self.list_headers(recipient));
        }
        cleaned
    }
}
