use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub logging_level: Option<String>,
    pub site_url: Option<String>,
    pub site_name: Option<String>,
    pub secret_key: Option<String>,
    pub admin_token: Option<String>,

    // Sections
    pub mail: Option<MailConfig>,
    pub queue: Option<QueueConfig>,
    pub downloads: Option<DownloadsConfig>,
    pub templates: Option<TemplatesConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MailConfig {
    /// "smtp" or "log"
    pub transport: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    /// "starttls", "tls" or "none"
    pub smtp_tls: Option<String>,
    pub smtp_timeout_secs: Option<u64>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: Option<usize>,
    pub send_interval_minutes: Option<u64>,
    pub process_interval_secs: Option<u64>,
    pub pause_every: Option<usize>,
    pub pause_secs: Option<u64>,
    pub business_hours_start: Option<u32>,
    pub business_hours_end: Option<u32>,
    pub utc_offset_minutes: Option<i32>,
    pub optimize_content: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadsConfig {
    pub require_verification: Option<bool>,
    pub skip_verification_for_verified: Option<bool>,
    pub allow_file_url_passthrough: Option<bool>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub files: Vec<DownloadFileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadFileConfig {
    pub post_id: i64,
    /// Matches any block of the post when absent.
    pub block_id: Option<String>,
    pub file_url: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TemplatesConfig {
    pub subscribe_subject: Option<String>,
    pub new_post_subject: Option<String>,
    /// "newsletter" or "alert"
    pub default_broadcast_profile: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
