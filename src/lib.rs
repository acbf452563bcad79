//! Newsletter Server Library
//!
//! This library exposes the internal modules for the binaries and the
//! integration tests.

pub mod background_jobs;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod deliverability;
pub mod downloads;
pub mod mailer;
pub mod newsletter_store;
pub mod queue_worker;
pub mod server;
pub mod server_store;
pub mod sqlite_persistence;
pub mod templates;
pub mod tokens;
pub mod unsubscribe;
pub mod verification;

// Re-export commonly used types for convenience
pub use newsletter_store::{FullNewsletterStore, SqliteNewsletterStore};
pub use server::{make_app, run_server, RequestsLoggingLevel};
pub use server_store::{ServerStore, SqliteServerStore};
