//! Drains the outbound email queue one batch at a time.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior},
};
use crate::queue_worker::{BatchOutcome, EmailQueueProcessor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct EmailQueueProcessorJob {
    processor: Arc<EmailQueueProcessor>,
    interval: Duration,
}

impl EmailQueueProcessorJob {
    pub fn new(processor: Arc<EmailQueueProcessor>, interval: Duration) -> Self {
        Self {
            processor,
            interval,
        }
    }
}

impl BackgroundJob for EmailQueueProcessorJob {
    fn id(&self) -> &'static str {
        "email_queue_processor"
    }

    fn name(&self) -> &'static str {
        "Email Queue Processor"
    }

    fn description(&self) -> &'static str {
        "Send the next batch of due emails from the queue"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnStartup, HookEvent::OnEmailsQueued],
        }
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        // Unsent rows stay queued for the next start
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let outcome = self
            .processor
            .process(&|| ctx.is_cancelled())
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        match outcome {
            BatchOutcome::Idle => debug!("Email queue is empty"),
            BatchOutcome::RateLimited {
                pending,
                retry_in_secs,
                ..
            } => {
                debug!(
                    "{} queued emails waiting, next batch allowed in {}s",
                    pending, retry_in_secs
                );
            }
            BatchOutcome::Processed {
                attempted,
                sent,
                failed,
                batch_size,
            } => {
                info!(
                    "Email batch done: {} attempted, {} sent, {} failed (batch size {})",
                    attempted, sent, failed, batch_size
                );
            }
        }

        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::mailer::RecordingMailer;
    use crate::newsletter_store::{EmailQueueStore, NewQueuedEmail, SqliteNewsletterStore};
    use crate::server_store::SqliteServerStore;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    const NOW: i64 = 1_699_931_600;

    fn setup() -> (
        EmailQueueProcessorJob,
        Arc<SqliteNewsletterStore>,
        Arc<RecordingMailer>,
        JobContext,
    ) {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let mut config = AppConfig::with_defaults(PathBuf::from("."), "0123456789abcdef");
        config.queue.pause_secs = 0;
        let processor = Arc::new(EmailQueueProcessor::new(
            store.clone(),
            server_store.clone(),
            mailer.clone(),
            clock.clone(),
            &config,
        ));
        let job = EmailQueueProcessorJob::new(processor, Duration::from_secs(60));
        let ctx = JobContext::new(CancellationToken::new(), server_store, clock);
        (job, store, mailer, ctx)
    }

    #[test]
    fn schedule_includes_queue_hook() {
        let (job, _, _, _) = setup();
        match job.schedule() {
            JobSchedule::Combined { interval, hooks } => {
                assert_eq!(interval, Some(Duration::from_secs(60)));
                assert!(hooks.contains(&HookEvent::OnEmailsQueued));
                assert!(hooks.contains(&HookEvent::OnStartup));
            }
            other => panic!("unexpected schedule {:?}", other),
        }
    }

    #[test]
    fn execute_sends_due_emails() {
        let (job, store, mailer, ctx) = setup();
        store
            .enqueue(&NewQueuedEmail {
                recipient: "reader@example.com".to_string(),
                subject: "Issue 1".to_string(),
                body: "<p>Hello</p>".to_string(),
                headers: vec![],
                send_at: NOW,
            })
            .unwrap();

        job.execute(&ctx).unwrap();

        assert_eq!(mailer.sent_to("reader@example.com").len(), 1);
        assert_eq!(store.count_due(NOW).unwrap(), 0);
    }

    #[test]
    fn execute_respects_cancellation() {
        let (job, _, _, ctx) = setup();
        ctx.cancellation_token.cancel();
        assert!(matches!(job.execute(&ctx), Err(JobError::Cancelled)));
    }
}
