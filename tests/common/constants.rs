//! Shared constants for end-to-end tests
//!
//! When test data changes (tokens, addresses, download entries),
//! update only this file.

// ============================================================================
// Server Secrets
// ============================================================================

/// Secret used to sign unsubscribe links
pub const SECRET_KEY: &str = "e2e-test-secret-key-0123456789";

/// Bearer token accepted by the admin API
pub const ADMIN_TOKEN: &str = "e2e-admin-token";

/// Site name shown in mails and pages
pub const SITE_NAME: &str = "Test Site";

// ============================================================================
// Test Data
// ============================================================================

/// Address used by most subscription flows
pub const READER_EMAIL: &str = "reader@example.com";

/// A second address for broadcast selection tests
pub const OTHER_EMAIL: &str = "other@example.com";

/// Post with a configured download
pub const DOWNLOAD_POST_ID: i64 = 42;

/// File behind DOWNLOAD_POST_ID
pub const DOWNLOAD_FILE_URL: &str = "https://files.example.com/field-guide.pdf";

/// Id of the job that drains the email queue
pub const QUEUE_JOB_ID: &str = "email_queue_processor";

// ============================================================================
// Test Timeouts and Configuration
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Timeout for individual HTTP requests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Polling interval when waiting for server ready (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Maximum time to wait for a queued email to reach the mailer (milliseconds)
pub const MAIL_WAIT_TIMEOUT_MS: u64 = 5000;
