use super::RequestsLoggingLevel;
use crate::config::AppConfig;

#[derive(Clone)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    /// Base URL used for redirects after verification.
    pub site_url: String,
    /// Bearer token for `/v1/admin`. The admin routes answer 404 without it.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            port: 3002,
            site_url: "http://localhost:3002".to_string(),
            admin_token: None,
        }
    }
}

impl From<&AppConfig> for ServerConfig {
    fn from(config: &AppConfig) -> Self {
        ServerConfig {
            requests_logging_level: config.logging_level.clone(),
            port: config.port,
            site_url: config.site.url.clone(),
            admin_token: config.admin_token.clone(),
        }
    }
}
