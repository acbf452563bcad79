//! Drains the email queue in adaptive batches.
//!
//! Each run sends at most one batch. Every attempted row is marked sent,
//! delivered or not; failures feed the reputation score and shrink the base
//! batch size for later runs.

use crate::clock::Clock;
use crate::config::{AppConfig, QueueSettings};
use crate::deliverability::{
    adjust_batch_size, reputation_score, track_email_failure, track_email_success,
    ContentOptimizer, HeaderEnhancer,
};
use crate::mailer::{is_valid_email, Mailer, OutgoingEmail};
use crate::newsletter_store::{FullNewsletterStore, QueuedEmail};
use crate::server::metrics;
use crate::server_store::{EmailAction, ServerStore};
use crate::templates::{escape_html, RECIPIENT_PLACEHOLDER, UNSUBSCRIBE_PLACEHOLDER};
use crate::unsubscribe::UnsubscribeLinks;
use anyhow::Result;
use chrono::{TimeZone, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LAST_BATCH_TIME_KEY: &str = "last_batch_time";
pub const BATCH_SIZE_OPTION: &str = "email_batch_size";
const LAST_BATCH_TIME_TTL_SECS: i64 = 60 * 60;
const BUSINESS_HOURS_BATCH_CAP: usize = 25;
const MIN_BASE_BATCH_SIZE: usize = 10;
const HEALTHY_SUCCESS_RATE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Nothing due.
    Idle,
    /// A batch ran recently and the backlog exceeds one batch.
    RateLimited {
        pending: usize,
        batch_size: usize,
        retry_in_secs: i64,
    },
    Processed {
        attempted: usize,
        sent: usize,
        failed: usize,
        batch_size: usize,
    },
}

/// Hour of day at `utc_offset_minutes` from UTC.
fn local_hour(now: i64, utc_offset_minutes: i32) -> u32 {
    let shifted = now + i64::from(utc_offset_minutes) * 60;
    Utc.timestamp_opt(shifted, 0)
        .single()
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

fn in_business_hours(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..=end).contains(&hour)
    } else {
        hour >= start || hour <= end
    }
}

pub struct EmailQueueProcessor {
    store: Arc<dyn FullNewsletterStore>,
    server_store: Arc<dyn ServerStore>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    enhancer: HeaderEnhancer,
    unsubscribe: UnsubscribeLinks,
    optimizer: Option<ContentOptimizer>,
    settings: QueueSettings,
}

impl EmailQueueProcessor {
    pub fn new(
        store: Arc<dyn FullNewsletterStore>,
        server_store: Arc<dyn ServerStore>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        let optimizer = config
            .queue
            .optimize_content
            .then(|| ContentOptimizer::new(&config.site.url));
        Self {
            store,
            server_store,
            mailer,
            clock,
            enhancer: HeaderEnhancer::from_config(config),
            unsubscribe: UnsubscribeLinks::from_config(config),
            optimizer,
            settings: config.queue.clone(),
        }
    }

    /// Persisted base batch size, or the configured one.
    pub fn base_batch_size(&self) -> Result<usize> {
        Ok(self
            .server_store
            .get_option(BATCH_SIZE_OPTION)?
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.batch_size))
    }

    /// Batch size for a run at `now`.
    pub fn effective_batch_size(&self, base: usize, now: i64) -> Result<usize> {
        let hour = local_hour(now, self.settings.utc_offset_minutes);
        let business = in_business_hours(
            hour,
            self.settings.business_hours_start,
            self.settings.business_hours_end,
        );
        let mut size = adjust_batch_size(base, business, reputation_score(&*self.server_store)?);
        if business {
            size = size.min(BUSINESS_HOURS_BATCH_CAP);
        }
        Ok(size.max(1))
    }

    fn pause(&self) {
        let secs = if cfg!(feature = "fast") {
            0
        } else {
            self.settings.pause_secs
        };
        if secs > 0 {
            std::thread::sleep(Duration::from_secs(secs));
        }
    }

    fn prepare(&self, row: &QueuedEmail) -> OutgoingEmail {
        let headers = if row.headers.is_empty() {
            self.enhancer.standard_headers(&row.recipient)
        } else {
            row.headers.clone()
        };
        let body = match &self.optimizer {
            Some(optimizer) => optimizer.optimize(&row.body),
            None => row.body.clone(),
        };
        let html_body = body
            .replace(UNSUBSCRIBE_PLACEHOLDER, &self.unsubscribe.link(&row.recipient))
            .replace(RECIPIENT_PLACEHOLDER, &escape_html(&row.recipient));
        OutgoingEmail {
            to: row.recipient.clone(),
            subject: row.subject.clone(),
            html_body,
            headers,
        }
    }

    /// Runs one batch. `is_cancelled` is polled between messages; rows not
    /// reached stay queued.
    pub fn process(&self, is_cancelled: &dyn Fn() -> bool) -> Result<BatchOutcome> {
        let now = self.clock.now();
        let base = self.base_batch_size()?;
        let batch_size = self.effective_batch_size(base, now)?;

        let pending = self.store.count_due(now)?;
        if pending == 0 {
            return Ok(BatchOutcome::Idle);
        }

        let interval_secs = self.settings.send_interval_minutes as i64 * 60;
        let last_batch = self
            .server_store
            .get_transient(LAST_BATCH_TIME_KEY, now)?
            .and_then(|v| v.parse::<i64>().ok());
        if let Some(last) = last_batch {
            let elapsed = now - last;
            if elapsed < interval_secs && pending > batch_size {
                debug!(
                    "Queue rate limited: {} pending, last batch {}s ago",
                    pending, elapsed
                );
                return Ok(BatchOutcome::RateLimited {
                    pending,
                    batch_size,
                    retry_in_secs: interval_secs - elapsed,
                });
            }
        }

        let rows = self.store.fetch_due_batch(now, batch_size)?;
        let mut sent = 0usize;
        let mut failed = 0usize;

        for row in &rows {
            if is_cancelled() {
                info!("Queue batch cancelled after {} messages", sent + failed);
                break;
            }

            if !is_valid_email(&row.recipient) {
                warn!("Dropping queued email {} with invalid recipient", row.id);
                self.store.mark_sent(row.id, self.clock.now())?;
                self.server_store.log_email_activity(
                    &row.recipient,
                    EmailAction::QueueInvalidRecipient,
                    None,
                    self.clock.now(),
                )?;
                failed += 1;
                metrics::record_email_delivery("invalid_recipient");
                continue;
            }

            let pause_every = self.settings.pause_every;
            if pause_every > 0 && sent > 0 && sent % pause_every == 0 {
                self.pause();
            }

            let email = self.prepare(row);
            match self.mailer.send(&email) {
                Ok(()) => {
                    sent += 1;
                    metrics::record_email_delivery("sent");
                    track_email_success(&*self.server_store)?;
                    self.server_store.log_email_activity(
                        &row.recipient,
                        EmailAction::QueueSent,
                        Some(&row.subject),
                        self.clock.now(),
                    )?;
                }
                Err(e) => {
                    failed += 1;
                    metrics::record_email_delivery("failed");
                    warn!("Failed to send queued email {}: {}", row.id, e);
                    track_email_failure(&*self.server_store)?;
                    self.server_store.log_email_activity(
                        &row.recipient,
                        EmailAction::QueueFailed,
                        Some(&e.to_string()),
                        self.clock.now(),
                    )?;
                }
            }
            self.store.mark_sent(row.id, self.clock.now())?;
        }

        self.server_store.set_transient(
            LAST_BATCH_TIME_KEY,
            &now.to_string(),
            LAST_BATCH_TIME_TTL_SECS,
            now,
        )?;

        let attempted = sent + failed;
        if attempted > 0 {
            let success_rate = sent as f64 / attempted as f64;
            if success_rate < HEALTHY_SUCCESS_RATE {
                let reduced = ((base as f64 * 0.8).floor() as usize).max(MIN_BASE_BATCH_SIZE);
                warn!(
                    "Success rate {:.2} below threshold, base batch size {} -> {}",
                    success_rate, base, reduced
                );
                self.server_store
                    .set_option(BATCH_SIZE_OPTION, &reduced.to_string())?;
            }
        }

        metrics::set_email_batch_size(batch_size);
        info!(
            "Processed queue batch: {} sent, {} failed (batch size {})",
            sent, failed, batch_size
        );
        Ok(BatchOutcome::Processed {
            attempted,
            sent,
            failed,
            batch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::deliverability::load_email_stats;
    use crate::mailer::RecordingMailer;
    use crate::newsletter_store::{EmailQueueStore, NewQueuedEmail, SqliteNewsletterStore};
    use crate::server_store::SqliteServerStore;
    use std::path::PathBuf;

    // 2023-11-14 03:13:20 UTC, outside business hours
    const NIGHT: i64 = 1_699_931_600;

    struct Fixture {
        worker: EmailQueueProcessor,
        store: Arc<SqliteNewsletterStore>,
        server_store: Arc<SqliteServerStore>,
        mailer: Arc<RecordingMailer>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(configure: impl FnOnce(&mut AppConfig)) -> Fixture {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::new());
        let clock = Arc::new(ManualClock::new(NIGHT));
        let mut config = AppConfig::with_defaults(PathBuf::from("."), "0123456789abcdef");
        config.site.url = "https://news.example.com".to_string();
        config.queue.pause_secs = 0;
        configure(&mut config);
        let worker = EmailQueueProcessor::new(
            store.clone(),
            server_store.clone(),
            mailer.clone(),
            clock.clone(),
            &config,
        );
        Fixture {
            worker,
            store,
            server_store,
            mailer,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn enqueue(store: &SqliteNewsletterStore, recipient: &str, send_at: i64) -> i64 {
        store
            .enqueue(&NewQueuedEmail {
                recipient: recipient.to_string(),
                subject: "Hello".to_string(),
                body: "<p>Hi</p><a href=\"{unsubscribe_link}\">bye</a>".to_string(),
                headers: vec![],
                send_at,
            })
            .unwrap()
    }

    fn never() -> bool {
        false
    }

    #[test]
    fn business_hours_window() {
        assert!(in_business_hours(9, 9, 17));
        assert!(in_business_hours(17, 9, 17));
        assert!(!in_business_hours(18, 9, 17));
        assert!(in_business_hours(23, 22, 2));
        assert!(!in_business_hours(12, 22, 2));
        assert_eq!(local_hour(NIGHT, 0), 3);
        assert_eq!(local_hour(NIGHT, 9 * 60), 12);
    }

    #[test]
    fn empty_queue_is_idle() {
        let f = fixture();
        assert_eq!(f.worker.process(&never).unwrap(), BatchOutcome::Idle);
    }

    #[test]
    fn sends_due_rows_and_marks_them() {
        let f = fixture();
        let id = enqueue(&f.store, "a@example.com", NIGHT - 10);
        enqueue(&f.store, "b@example.com", NIGHT + 3600);

        let outcome = f.worker.process(&never).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Processed {
                attempted: 1,
                sent: 1,
                failed: 0,
                batch_size: 75,
            }
        );

        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@example.com");
        assert!(sent[0].headers.contains(&"X-WNS: newsletter".to_string()));
        assert!(sent[0]
            .html_body
            .contains("https://news.example.com/unsubscribe?email=a%40example.com&token="));

        let row = f.store.get_email(id).unwrap().unwrap();
        assert!(row.sent);
        assert_eq!(row.sent_at, Some(NIGHT));
        assert_eq!(load_email_stats(&*f.server_store).unwrap().sent, 1);
        assert_eq!(
            f.server_store.get_transient(LAST_BATCH_TIME_KEY, NIGHT).unwrap(),
            Some(NIGHT.to_string())
        );
    }

    #[test]
    fn failures_are_not_retried_and_shrink_base() {
        let f = fixture();
        for i in 0..5 {
            enqueue(&f.store, &format!("user{}@example.com", i), NIGHT);
        }
        f.mailer.set_failing(true);

        let outcome = f.worker.process(&never).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Processed {
                attempted: 5,
                sent: 0,
                failed: 5,
                batch_size: 75,
            }
        );
        assert_eq!(f.store.count_due(NIGHT).unwrap(), 0);
        assert_eq!(f.worker.base_batch_size().unwrap(), 40);
        assert_eq!(load_email_stats(&*f.server_store).unwrap().failed, 5);

        // Low reputation now caps the batch
        assert_eq!(f.worker.effective_batch_size(40, NIGHT).unwrap(), 25);
    }

    #[test]
    fn base_never_drops_below_ten() {
        let f = fixture_with(|c| c.queue.batch_size = 11);
        enqueue(&f.store, "a@example.com", NIGHT);
        f.mailer.set_failing(true);
        f.worker.process(&never).unwrap();
        assert_eq!(f.worker.base_batch_size().unwrap(), 10);
    }

    #[test]
    fn invalid_recipient_is_marked_sent_without_mailing() {
        let f = fixture();
        let id = enqueue(&f.store, "not-an-address", NIGHT);
        let outcome = f.worker.process(&never).unwrap();
        assert!(matches!(
            outcome,
            BatchOutcome::Processed { attempted: 1, sent: 0, failed: 1, .. }
        ));
        assert!(f.mailer.sent().is_empty());
        assert!(f.store.get_email(id).unwrap().unwrap().sent);
        let activity = f.server_store.get_email_activity(10, 0).unwrap();
        assert_eq!(activity[0].action, "queue_invalid_recipient");
    }

    #[test]
    fn rate_limited_when_backlog_exceeds_batch() {
        let f = fixture_with(|c| c.queue.batch_size = 2);
        for i in 0..10 {
            enqueue(&f.store, &format!("user{}@example.com", i), NIGHT);
        }

        // Reputation 1.0 grows the batch to 3
        let first = f.worker.process(&never).unwrap();
        assert!(matches!(first, BatchOutcome::Processed { sent: 3, batch_size: 3, .. }));

        f.clock.advance(60);
        let second = f.worker.process(&never).unwrap();
        assert_eq!(
            second,
            BatchOutcome::RateLimited {
                pending: 7,
                batch_size: 3,
                retry_in_secs: 240,
            }
        );

        f.clock.advance(240);
        let third = f.worker.process(&never).unwrap();
        assert!(matches!(third, BatchOutcome::Processed { sent: 3, .. }));
    }

    #[test]
    fn small_backlog_is_not_rate_limited() {
        let f = fixture();
        enqueue(&f.store, "a@example.com", NIGHT);
        f.worker.process(&never).unwrap();

        f.clock.advance(30);
        enqueue(&f.store, "b@example.com", f.clock.now());
        let outcome = f.worker.process(&never).unwrap();
        assert!(matches!(outcome, BatchOutcome::Processed { sent: 1, .. }));
    }

    #[test]
    fn business_hours_cap_at_twenty_five() {
        let f = fixture_with(|c| c.queue.batch_size = 100);
        let noon = NIGHT - NIGHT % 86_400 + 12 * 3600;
        f.clock.set(noon);
        assert_eq!(local_hour(noon, 0), 12);
        assert_eq!(f.worker.effective_batch_size(100, noon).unwrap(), 25);
    }

    #[test]
    fn cancelled_batch_leaves_rest_queued() {
        let f = fixture();
        enqueue(&f.store, "a@example.com", NIGHT);
        enqueue(&f.store, "b@example.com", NIGHT);
        let outcome = f.worker.process(&|| true).unwrap();
        assert!(matches!(outcome, BatchOutcome::Processed { attempted: 0, .. }));
        assert_eq!(f.store.count_due(NIGHT).unwrap(), 2);
    }

    #[test]
    fn optimizer_runs_before_link_substitution() {
        let f = fixture_with(|c| c.queue.optimize_content = true);
        f.store
            .enqueue(&NewQueuedEmail {
                recipient: "a@example.com".to_string(),
                subject: "Hello".to_string(),
                body: "<p>HUGE SALE!!!</p>".to_string(),
                headers: vec!["X-WNS: alert".to_string()],
                send_at: NIGHT,
            })
            .unwrap();
        f.worker.process(&never).unwrap();

        let sent = &f.mailer.sent()[0];
        assert!(sent.html_body.contains("Huge Sale!"));
        assert!(sent.html_body.contains("Unsubscribe from this newsletter"));
        assert!(!sent.html_body.contains(UNSUBSCRIBE_PLACEHOLDER));
        assert_eq!(sent.headers, vec!["X-WNS: alert".to_string()]);
    }
}
