use serde::{Deserialize, Serialize};

/// Lower-cases and trims an address so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// =============================================================================
// Subscribers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub verified: bool,
    /// Unix timestamp (seconds)
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberOrderBy {
    Email,
    Verified,
    #[default]
    CreatedAt,
}

impl SubscriberOrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            SubscriberOrderBy::Email => "email",
            SubscriberOrderBy::Verified => "verified",
            SubscriberOrderBy::CreatedAt => "created_at",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(SubscriberOrderBy::Email),
            "verified" => Some(SubscriberOrderBy::Verified),
            "created_at" => Some(SubscriberOrderBy::CreatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberFilter {
    /// Substring match on the address. Ignored unless it contains `@`.
    pub search: Option<String>,
    pub verified: Option<bool>,
    pub order_by: SubscriberOrderBy,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SubscriberFilter {
    fn default() -> Self {
        Self {
            search: None,
            verified: None,
            order_by: SubscriberOrderBy::CreatedAt,
            descending: true,
            limit: 20,
            offset: 0,
        }
    }
}

impl SubscriberFilter {
    pub fn effective_search(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| s.contains('@'))
    }
}

// =============================================================================
// Email queue
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub headers: Vec<String>,
    pub send_at: i64,
    pub sent: bool,
    pub sent_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewQueuedEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub headers: Vec<String>,
    pub send_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatusFilter {
    Sent,
    Pending,
}

impl QueueStatusFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(QueueStatusFilter::Sent),
            "pending" => Some(QueueStatusFilter::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrderBy {
    Recipient,
    Subject,
    #[default]
    SendAt,
    SentAt,
    Sent,
}

impl QueueOrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            QueueOrderBy::Recipient => "recipient",
            QueueOrderBy::Subject => "subject",
            QueueOrderBy::SendAt => "send_at",
            QueueOrderBy::SentAt => "sent_at",
            QueueOrderBy::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recipient" => Some(QueueOrderBy::Recipient),
            "subject" => Some(QueueOrderBy::Subject),
            "send_at" => Some(QueueOrderBy::SendAt),
            "sent_at" => Some(QueueOrderBy::SentAt),
            "sent" => Some(QueueOrderBy::Sent),
            _ => None,
        }
    }
}

/// Page sizes the admin queue listing accepts.
pub const QUEUE_PAGE_SIZES: &[usize] = &[20, 50, 100, 200, 500];

#[derive(Debug, Clone)]
pub struct QueueFilter {
    pub status: Option<QueueStatusFilter>,
    pub order_by: QueueOrderBy,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for QueueFilter {
    fn default() -> Self {
        Self {
            status: None,
            order_by: QueueOrderBy::SendAt,
            descending: true,
            limit: QUEUE_PAGE_SIZES[0],
            offset: 0,
        }
    }
}

impl QueueFilter {
    /// Falls back to the smallest page size for values outside the allowed set.
    pub fn page_size(requested: Option<usize>) -> usize {
        requested
            .filter(|n| QUEUE_PAGE_SIZES.contains(n))
            .unwrap_or(QUEUE_PAGE_SIZES[0])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    /// Pending rows whose send time has passed.
    pub due: usize,
    pub sent: usize,
}

// =============================================================================
// Download tokens
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadToken {
    pub id: i64,
    pub email: String,
    pub token: String,
    pub file_url: String,
    pub post_id: i64,
    pub block_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
    pub verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewDownloadToken {
    pub email: String,
    pub token: String,
    pub file_url: String,
    pub post_id: i64,
    pub block_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub verified: bool,
}
