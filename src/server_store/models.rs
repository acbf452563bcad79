use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobRunStatus::Running),
            "completed" => Some(JobRunStatus::Completed),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: i64,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobRunStatus,
    pub error_message: Option<String>,
    /// How the job was triggered: "schedule", "hook:OnEmailsQueued", "manual", etc.
    pub triggered_by: String,
}

#[derive(Debug, Clone)]
pub struct JobScheduleState {
    pub job_id: String,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Kinds of entries written to the email activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailAction {
    QueueSent,
    QueueFailed,
    QueueInvalidRecipient,
    VerificationQueued,
    SubscriptionVerified,
    Unsubscribed,
    DownloadRequested,
    DownloadVerified,
    DownloadRedeemed,
    NewPostQueued,
}

impl EmailAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailAction::QueueSent => "queue_sent",
            EmailAction::QueueFailed => "queue_failed",
            EmailAction::QueueInvalidRecipient => "queue_invalid_recipient",
            EmailAction::VerificationQueued => "verification_queued",
            EmailAction::SubscriptionVerified => "subscription_verified",
            EmailAction::Unsubscribed => "unsubscribed",
            EmailAction::DownloadRequested => "download_requested",
            EmailAction::DownloadVerified => "download_verified",
            EmailAction::DownloadRedeemed => "download_redeemed",
            EmailAction::NewPostQueued => "new_post_queued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queue_sent" => Some(EmailAction::QueueSent),
            "queue_failed" => Some(EmailAction::QueueFailed),
            "queue_invalid_recipient" => Some(EmailAction::QueueInvalidRecipient),
            "verification_queued" => Some(EmailAction::VerificationQueued),
            "subscription_verified" => Some(EmailAction::SubscriptionVerified),
            "unsubscribed" => Some(EmailAction::Unsubscribed),
            "download_requested" => Some(EmailAction::DownloadRequested),
            "download_verified" => Some(EmailAction::DownloadVerified),
            "download_redeemed" => Some(EmailAction::DownloadRedeemed),
            "new_post_queued" => Some(EmailAction::NewPostQueued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailActivity {
    pub id: i64,
    pub email: String,
    /// Raw action string, kept as text so unknown values from older rows survive.
    pub action: String,
    pub details: Option<String>,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
}
