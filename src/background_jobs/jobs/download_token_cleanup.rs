//! Removes download tokens long past their expiry.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use crate::downloads::DownloadService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct DownloadTokenCleanupJob {
    downloads: Arc<DownloadService>,
}

impl DownloadTokenCleanupJob {
    pub fn new(downloads: Arc<DownloadService>) -> Self {
        Self { downloads }
    }
}

impl BackgroundJob for DownloadTokenCleanupJob {
    fn id(&self) -> &'static str {
        "download_token_cleanup"
    }

    fn name(&self) -> &'static str {
        "Download Token Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete download tokens that expired more than 48 hours ago"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(24 * 60 * 60))
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let deleted = self
            .downloads
            .cleanup_expired_tokens(ctx.clock.now())
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!("Deleted {} expired download tokens", deleted);
        } else {
            debug!("No expired download tokens to delete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::downloads::{DOWNLOAD_TOKEN_TTL_SECS, EXPIRED_TOKEN_RETENTION_SECS};
    use crate::mailer::RecordingMailer;
    use crate::newsletter_store::{DownloadTokenStore, NewDownloadToken, SqliteNewsletterStore};
    use crate::server_store::SqliteServerStore;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    const NOW: i64 = 1_700_000_000;

    fn token(store: &SqliteNewsletterStore, token: &str, expires_at: i64) {
        store
            .insert_download_token(&NewDownloadToken {
                email: "reader@example.com".to_string(),
                token: token.to_string(),
                file_url: "https://files.example.com/guide.pdf".to_string(),
                post_id: 7,
                block_id: String::new(),
                created_at: expires_at - DOWNLOAD_TOKEN_TTL_SECS,
                expires_at,
                verified: false,
            })
            .unwrap();
    }

    #[test]
    fn deletes_only_tokens_past_retention() {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(NOW));
        let config = AppConfig::with_defaults(PathBuf::from("."), "0123456789abcdef");
        let downloads = Arc::new(DownloadService::new(
            store.clone(),
            server_store.clone(),
            Arc::new(RecordingMailer::new()),
            clock.clone(),
            &config,
        ));

        token(&store, "old", NOW - EXPIRED_TOKEN_RETENTION_SECS - 1);
        token(&store, "recent", NOW - 60);
        token(&store, "live", NOW + 3600);

        let job = DownloadTokenCleanupJob::new(downloads);
        let ctx = JobContext::new(CancellationToken::new(), server_store, clock);
        job.execute(&ctx).unwrap();

        assert!(store
            .find_active_download_token("live", "reader@example.com", NOW)
            .unwrap()
            .is_some());
        // Second pass has nothing left to delete past retention
        assert_eq!(
            store
                .delete_download_tokens_expired_before(NOW - EXPIRED_TOKEN_RETENTION_SECS)
                .unwrap(),
            0
        );
        assert_eq!(store.delete_download_tokens_expired_before(NOW).unwrap(), 1);
    }
}
