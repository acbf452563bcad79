//! Deliverability tuning: marker-driven header rewriting, adaptive batch
//! sizing from send statistics, and opt-in content cleanup.

mod batch;
mod content;
mod headers;

pub use batch::{
    adjust_batch_size, load_email_stats, progressive_delay, reputation_score, reset_email_stats,
    track_email_failure, track_email_success, EmailStats, EMAIL_STATS_OPTION,
};
pub use content::ContentOptimizer;
pub use headers::{classify_marker, parse_marker, HeaderEnhancer, MarkerClass};

use serde::{Deserialize, Serialize};

/// Header profile of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Lean transactional headers.
    Alert,
    /// Full bulk-mail `List-*` headers.
    Newsletter,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Alert => "alert",
            Profile::Newsletter => "newsletter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Some(Profile::Alert),
            "newsletter" => Some(Profile::Newsletter),
            _ => None,
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
