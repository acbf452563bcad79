use crate::server_store::ServerStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const EMAIL_STATS_OPTION: &str = "email_stats";

const BUSINESS_HOURS_CAP: usize = 50;
const LOW_REPUTATION_CAP: usize = 25;
const MAX_BATCH_SIZE: usize = 200;

/// Running send counters kept in the options table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailStats {
    pub sent: u64,
    pub failed: u64,
    /// Unix timestamp (seconds) of the last reset.
    pub last_reset: i64,
}

impl EmailStats {
    pub fn reputation(&self) -> f64 {
        let total = self.sent + self.failed;
        if total == 0 {
            1.0
        } else {
            self.sent as f64 / total as f64
        }
    }
}

/// Scales the base batch size by time of day and sender reputation.
pub fn adjust_batch_size(base: usize, in_business_hours: bool, reputation: f64) -> usize {
    let mut size = base;
    if in_business_hours {
        size = size.min(BUSINESS_HOURS_CAP);
    }
    if reputation < 0.8 {
        size = size.min(LOW_REPUTATION_CAP);
    } else if reputation > 0.95 {
        size = ((size as f64 * 1.5).round() as usize).min(MAX_BATCH_SIZE);
    }
    size
}

/// Delay in seconds before the `batch_number`-th follow-up batch.
pub fn progressive_delay(batch_number: u32) -> u64 {
    let delay = 60.0 * (1.0 + 0.1 * batch_number as f64);
    delay.min(600.0) as u64
}

/// Unreadable stats are treated as empty rather than failing the caller.
pub fn load_email_stats(store: &dyn ServerStore) -> Result<EmailStats> {
    let Some(raw) = store.get_option(EMAIL_STATS_OPTION)? else {
        return Ok(EmailStats::default());
    };
    match serde_json::from_str(&raw) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            warn!("Discarding malformed {} option: {}", EMAIL_STATS_OPTION, e);
            Ok(EmailStats::default())
        }
    }
}

fn save_email_stats(store: &dyn ServerStore, stats: &EmailStats) -> Result<()> {
    store.set_option(EMAIL_STATS_OPTION, &serde_json::to_string(stats)?)
}

pub fn track_email_success(store: &dyn ServerStore) -> Result<()> {
    let mut stats = load_email_stats(store)?;
    stats.sent += 1;
    save_email_stats(store, &stats)
}

pub fn track_email_failure(store: &dyn ServerStore) -> Result<()> {
    let mut stats = load_email_stats(store)?;
    stats.failed += 1;
    save_email_stats(store, &stats)
}

pub fn reputation_score(store: &dyn ServerStore) -> Result<f64> {
    Ok(load_email_stats(store)?.reputation())
}

pub fn reset_email_stats(store: &dyn ServerStore, now: i64) -> Result<()> {
    save_email_stats(
        store,
        &EmailStats {
            sent: 0,
            failed: 0,
            last_reset: now,
        },
    )
}
