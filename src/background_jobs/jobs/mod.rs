mod download_token_cleanup;
mod email_queue_processor;
mod transient_cleanup;

pub use download_token_cleanup::DownloadTokenCleanupJob;
pub use email_queue_processor::EmailQueueProcessorJob;
pub use transient_cleanup::{TransientCleanupJob, ACTIVITY_RETENTION_DAYS};
