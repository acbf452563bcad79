mod models;
mod schema;
mod sqlite_server_store;

pub use models::*;
pub use schema::SERVER_VERSIONED_SCHEMAS;
pub use sqlite_server_store::SqliteServerStore;

use anyhow::Result;

pub trait ServerStore: Send + Sync {
    fn record_job_start(&self, job_id: &str, triggered_by: &str) -> Result<i64>;
    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    fn get_running_jobs(&self) -> Result<Vec<JobRun>>;
    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;
    fn get_last_run(&self, job_id: &str) -> Result<Option<JobRun>>;
    fn mark_stale_jobs_failed(&self) -> Result<usize>;

    // Schedule state
    fn get_schedule_state(&self, job_id: &str) -> Result<Option<JobScheduleState>>;
    fn update_schedule_state(&self, state: &JobScheduleState) -> Result<()>;

    // Options
    fn get_option(&self, key: &str) -> Result<Option<String>>;
    fn set_option(&self, key: &str, value: &str) -> Result<()>;
    fn delete_option(&self, key: &str) -> Result<()>;

    // Transients
    fn set_transient(&self, key: &str, value: &str, ttl_secs: i64, now: i64) -> Result<()>;
    /// Expired entries read as absent and are removed on the way.
    fn get_transient(&self, key: &str, now: i64) -> Result<Option<String>>;
    fn delete_transient(&self, key: &str) -> Result<()>;
    fn purge_expired_transients(&self, now: i64) -> Result<usize>;

    // Email activity log
    fn log_email_activity(
        &self,
        email: &str,
        action: EmailAction,
        details: Option<&str>,
        now: i64,
    ) -> Result<i64>;
    fn get_email_activity(&self, limit: usize, offset: usize) -> Result<Vec<EmailActivity>>;
    fn cleanup_old_email_activity(&self, before_timestamp: i64) -> Result<usize>;
}
