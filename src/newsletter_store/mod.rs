mod models;
mod schema;
mod sqlite_newsletter_store;

pub use models::*;
pub use schema::NEWSLETTER_VERSIONED_SCHEMAS;
pub use sqlite_newsletter_store::SqliteNewsletterStore;

use anyhow::Result;

pub trait SubscriberStore: Send + Sync {
    /// Inserts the subscriber if missing. For an existing subscriber `Some(v)`
    /// overwrites the verified flag and `None` leaves it untouched.
    /// `verified: None` inserts an unverified row and leaves an existing one
    /// untouched.
    fn add_or_update_subscriber(
        &self,
        email: &str,
        verified: Option<bool>,
        now: i64,
    ) -> Result<Subscriber>;
    fn get_subscriber(&self, email: &str) -> Result<Option<Subscriber>>;
    fn is_subscriber_verified(&self, email: &str) -> Result<bool>;
    /// Returns true if a row changed.
    fn mark_verified(&self, email: &str) -> Result<bool>;
    fn delete_subscriber(&self, email: &str) -> Result<bool>;

    fn list_subscribers(&self, filter: &SubscriberFilter) -> Result<Vec<Subscriber>>;
    /// Counts rows matching the filter, ignoring its paging.
    fn count_subscribers(&self, filter: &SubscriberFilter) -> Result<usize>;

    /// Verified addresses, optionally restricted to `selection`.
    fn get_verified_emails(&self, selection: Option<&[String]>) -> Result<Vec<String>>;

    // Bulk admin actions
    fn delete_subscribers(&self, ids: &[i64]) -> Result<usize>;
    fn set_verified(&self, ids: &[i64], verified: bool) -> Result<usize>;
    fn delete_unverified(&self) -> Result<usize>;
}

pub trait EmailQueueStore: Send + Sync {
    fn enqueue(&self, email: &NewQueuedEmail) -> Result<i64>;
    fn get_email(&self, id: i64) -> Result<Option<QueuedEmail>>;

    /// Unsent rows with `send_at <= now`.
    fn count_due(&self, now: i64) -> Result<usize>;
    /// Up to `limit` unsent due rows, oldest id first.
    fn fetch_due_batch(&self, now: i64, limit: usize) -> Result<Vec<QueuedEmail>>;
    fn mark_sent(&self, id: i64, sent_at: i64) -> Result<()>;

    fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<QueuedEmail>>;
    fn count_queue(&self, status: Option<QueueStatusFilter>) -> Result<usize>;
    fn queue_stats(&self, now: i64) -> Result<QueueStats>;

    // Bulk admin actions
    fn delete_emails(&self, ids: &[i64]) -> Result<usize>;
    /// Puts rows back in the queue, due at `now`.
    fn resend_emails(&self, ids: &[i64], now: i64) -> Result<usize>;
    fn delete_pending(&self) -> Result<usize>;
}

pub trait DownloadTokenStore: Send + Sync {
    fn insert_download_token(&self, token: &NewDownloadToken) -> Result<i64>;
    /// Token row matching token and email that is unused and not expired at `now`.
    fn find_active_download_token(
        &self,
        token: &str,
        email: &str,
        now: i64,
    ) -> Result<Option<DownloadToken>>;
    fn mark_download_token_verified(&self, id: i64) -> Result<()>;
    /// Returns false if the token was already used.
    fn mark_download_token_used(&self, id: i64) -> Result<bool>;
    fn delete_download_tokens_expired_before(&self, cutoff: i64) -> Result<usize>;
}

pub trait FullNewsletterStore: SubscriberStore + EmailQueueStore + DownloadTokenStore {}

impl<T: SubscriberStore + EmailQueueStore + DownloadTokenStore> FullNewsletterStore for T {}
