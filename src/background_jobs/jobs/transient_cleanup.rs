//! Hourly housekeeping for the server database.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use std::time::Duration;
use tracing::info;

/// Email activity entries older than this are deleted.
pub const ACTIVITY_RETENTION_DAYS: i64 = 90;

/// Purges expired transients and old email activity.
#[derive(Default)]
pub struct TransientCleanupJob;

impl TransientCleanupJob {
    pub fn new() -> Self {
        Self
    }
}

impl BackgroundJob for TransientCleanupJob {
    fn id(&self) -> &'static str {
        "transient_cleanup"
    }

    fn name(&self) -> &'static str {
        "Transient Cleanup"
    }

    fn description(&self) -> &'static str {
        "Purge expired transients and email activity older than 90 days"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(60 * 60))
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let now = ctx.clock.now();
        let transients = ctx.server_store.purge_expired_transients(now)?;

        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = now - ACTIVITY_RETENTION_DAYS * 24 * 60 * 60;
        let activity = ctx.server_store.cleanup_old_email_activity(cutoff)?;

        if transients > 0 || activity > 0 {
            info!(
                "Purged {} expired transients and {} old activity entries",
                transients, activity
            );
        }
        Ok(())
    }
}
