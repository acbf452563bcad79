mod file_config;

pub use file_config::{
    DownloadFileConfig, DownloadsConfig, FileConfig, MailConfig, QueueConfig, TemplatesConfig,
};

use crate::deliverability::Profile;
use crate::mailer::is_valid_email;
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use url::Url;

pub const MIN_SECRET_KEY_LEN: usize = 16;

/// CLI arguments that can be used for config resolution.
/// Mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub site_url: Option<String>,
    pub secret_key: Option<String>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub site: SiteSettings,
    pub secret_key: String,
    /// Admin routes are disabled when absent.
    pub admin_token: Option<String>,

    // Feature configs (with defaults)
    pub mail: MailSettings,
    pub queue: QueueSettings,
    pub downloads: DownloadSettings,
    pub templates: TemplateSettings,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Base URL without trailing slash.
    pub url: String,
    pub name: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:3002".to_string(),
            name: "Newsletter".to_string(),
        }
    }
}

impl SiteSettings {
    /// Host part of the site URL, without credentials or port.
    pub fn domain(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailTransportKind {
    Smtp,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpTls {
    StartTls,
    Tls,
    None,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub transport: MailTransportKind,
    /// Present when `transport` is smtp.
    pub smtp: Option<SmtpSettings>,
    pub sender_email: String,
    pub sender_name: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            transport: MailTransportKind::Log,
            smtp: None,
            sender_email: "newsletter@localhost".to_string(),
            sender_name: SiteSettings::default().name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Initial base batch size, before the worker persists its own.
    pub batch_size: usize,
    pub send_interval_minutes: u64,
    pub process_interval_secs: u64,
    pub pause_every: usize,
    pub pause_secs: u64,
    pub business_hours_start: u32,
    /// Inclusive.
    pub business_hours_end: u32,
    pub utc_offset_minutes: i32,
    pub optimize_content: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            send_interval_minutes: 5,
            process_interval_secs: 60,
            pause_every: 10,
            pause_secs: 2,
            business_hours_start: 9,
            business_hours_end: 17,
            utc_offset_minutes: 0,
            optimize_content: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadFile {
    pub post_id: i64,
    pub block_id: Option<String>,
    pub file_url: String,
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub require_verification: bool,
    pub skip_verification_for_verified: bool,
    pub allow_file_url_passthrough: bool,
    pub email_subject: String,
    /// Plain text, `{download_link}` is replaced.
    pub email_body: String,
    pub files: Vec<DownloadFile>,
}

pub const DEFAULT_DOWNLOAD_SUBJECT: &str = "Your Download Link is Ready!";
pub const DEFAULT_DOWNLOAD_BODY: &str = "Hi there,\n\nThank you for subscribing! Your download is ready.\n\nClick the link below to download your file:\n{download_link}\n\nThis link will expire in 24 hours for security reasons.\n\nBest regards,\nThe Team";

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            require_verification: false,
            skip_verification_for_verified: true,
            allow_file_url_passthrough: false,
            email_subject: DEFAULT_DOWNLOAD_SUBJECT.to_string(),
            email_body: DEFAULT_DOWNLOAD_BODY.to_string(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub subscribe_subject: String,
    /// `{post_title}` is replaced.
    pub new_post_subject: String,
    pub default_broadcast_profile: Profile,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            subscribe_subject: "Confirm Your Subscription".to_string(),
            new_post_subject: "{post_title}".to_string(),
            default_broadcast_profile: Profile::Newsletter,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let site_defaults = SiteSettings::default();
        let site = SiteSettings {
            url: file
                .site_url
                .or_else(|| cli.site_url.clone())
                .unwrap_or(site_defaults.url)
                .trim_end_matches('/')
                .to_string(),
            name: file.site_name.unwrap_or(site_defaults.name),
        };
        match Url::parse(&site.url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") && u.has_host() => {}
            _ => bail!("site_url must be an absolute http(s) URL: {}", site.url),
        }

        let secret_key = file
            .secret_key
            .or_else(|| cli.secret_key.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("secret_key must be specified via --secret-key or in config file")
            })?;
        if secret_key.len() < MIN_SECRET_KEY_LEN {
            bail!(
                "secret_key must be at least {} characters long",
                MIN_SECRET_KEY_LEN
            );
        }

        let admin_token = file
            .admin_token
            .or_else(|| cli.admin_token.clone())
            .filter(|t| !t.is_empty());

        let mail = resolve_mail(file.mail.unwrap_or_default(), &site)?;
        let queue = resolve_queue(file.queue.unwrap_or_default())?;
        let downloads = resolve_downloads(file.downloads.unwrap_or_default());
        let templates = resolve_templates(file.templates.unwrap_or_default())?;

        Ok(Self {
            db_dir,
            port,
            logging_level,
            site,
            secret_key,
            admin_token,
            mail,
            queue,
            downloads,
            templates,
        })
    }

    /// Configuration with every optional setting at its default.
    pub fn with_defaults(db_dir: PathBuf, secret_key: &str) -> Self {
        Self {
            db_dir,
            port: 3002,
            logging_level: RequestsLoggingLevel::default(),
            site: SiteSettings::default(),
            secret_key: secret_key.to_string(),
            admin_token: None,
            mail: MailSettings::default(),
            queue: QueueSettings::default(),
            downloads: DownloadSettings::default(),
            templates: TemplateSettings::default(),
        }
    }

    pub fn newsletter_db_path(&self) -> PathBuf {
        self.db_dir.join("newsletter.db")
    }

    pub fn server_db_path(&self) -> PathBuf {
        self.db_dir.join("server.db")
    }
}

fn resolve_mail(mail: MailConfig, site: &SiteSettings) -> Result<MailSettings> {
    let defaults = MailSettings::default();

    let transport = match mail.transport.as_deref() {
        None | Some("log") => MailTransportKind::Log,
        Some("smtp") => MailTransportKind::Smtp,
        Some(other) => bail!("Unknown mail transport '{}', expected smtp or log", other),
    };

    let smtp = match transport {
        MailTransportKind::Log => None,
        MailTransportKind::Smtp => {
            let host = mail
                .smtp_host
                .ok_or_else(|| anyhow::anyhow!("mail.smtp_host is required for smtp transport"))?;
            let tls = match mail.smtp_tls.as_deref() {
                None | Some("starttls") => SmtpTls::StartTls,
                Some("tls") => SmtpTls::Tls,
                Some("none") => SmtpTls::None,
                Some(other) => bail!("Unknown smtp_tls mode '{}'", other),
            };
            Some(SmtpSettings {
                host,
                port: mail.smtp_port.unwrap_or(587),
                username: mail.smtp_username,
                password: mail.smtp_password,
                tls,
                timeout_secs: mail.smtp_timeout_secs.unwrap_or(30),
            })
        }
    };

    let sender_email = mail.sender_email.unwrap_or(defaults.sender_email);
    if !is_valid_email(&sender_email) {
        bail!("mail.sender_email is not a valid address: {}", sender_email);
    }

    Ok(MailSettings {
        transport,
        smtp,
        sender_email,
        sender_name: mail.sender_name.unwrap_or_else(|| site.name.clone()),
    })
}

fn resolve_queue(queue: QueueConfig) -> Result<QueueSettings> {
    let defaults = QueueSettings::default();
    let settings = QueueSettings {
        batch_size: queue.batch_size.unwrap_or(defaults.batch_size),
        send_interval_minutes: queue
            .send_interval_minutes
            .unwrap_or(defaults.send_interval_minutes),
        process_interval_secs: queue
            .process_interval_secs
            .unwrap_or(defaults.process_interval_secs),
        pause_every: queue.pause_every.unwrap_or(defaults.pause_every),
        pause_secs: queue.pause_secs.unwrap_or(defaults.pause_secs),
        business_hours_start: queue
            .business_hours_start
            .unwrap_or(defaults.business_hours_start),
        business_hours_end: queue
            .business_hours_end
            .unwrap_or(defaults.business_hours_end),
        utc_offset_minutes: queue
            .utc_offset_minutes
            .unwrap_or(defaults.utc_offset_minutes),
        optimize_content: queue.optimize_content.unwrap_or(defaults.optimize_content),
    };

    if settings.batch_size == 0 {
        bail!("queue.batch_size must be greater than zero");
    }
    if settings.process_interval_secs == 0 {
        bail!("queue.process_interval_secs must be greater than zero");
    }
    if settings.business_hours_start > 23 || settings.business_hours_end > 23 {
        bail!("queue business hours must be between 0 and 23");
    }
    Ok(settings)
}

fn resolve_downloads(downloads: DownloadsConfig) -> DownloadSettings {
    let defaults = DownloadSettings::default();
    DownloadSettings {
        require_verification: downloads
            .require_verification
            .unwrap_or(defaults.require_verification),
        skip_verification_for_verified: downloads
            .skip_verification_for_verified
            .unwrap_or(defaults.skip_verification_for_verified),
        allow_file_url_passthrough: downloads
            .allow_file_url_passthrough
            .unwrap_or(defaults.allow_file_url_passthrough),
        email_subject: downloads.email_subject.unwrap_or(defaults.email_subject),
        email_body: downloads.email_body.unwrap_or(defaults.email_body),
        files: downloads
            .files
            .into_iter()
            .map(|f| DownloadFile {
                post_id: f.post_id,
                block_id: f.block_id.filter(|b| !b.is_empty()),
                file_url: f.file_url,
            })
            .collect(),
    }
}

fn resolve_templates(templates: TemplatesConfig) -> Result<TemplateSettings> {
    let defaults = TemplateSettings::default();
    let default_broadcast_profile = match templates.default_broadcast_profile.as_deref() {
        None => defaults.default_broadcast_profile,
        Some(s) => Profile::parse(s)
            .ok_or_else(|| anyhow::anyhow!("Unknown default_broadcast_profile '{}'", s))?,
    };
    Ok(TemplateSettings {
        subscribe_subject: templates
            .subscribe_subject
            .unwrap_or(defaults.subscribe_subject),
        new_post_subject: templates
            .new_post_subject
            .unwrap_or(defaults.new_post_subject),
        default_broadcast_profile,
    })
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
