//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, TestClient, READER_EMAIL};
//! use reqwest::StatusCode;
//!
//! #[tokio::test]
//! async fn test_subscribe() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::new(server.base_url.clone());
//!
//!     let response = client.subscribe(READER_EMAIL).await;
//!     assert_eq!(response.status(), StatusCode::OK);
//! }
//! ```

mod client;
mod constants;
mod mail;
mod server;

// Public API - this is what tests import
pub use client::TestClient;
pub use constants::*;
#[allow(unused_imports)]
pub use mail::{extract_link, query_param};
pub use server::TestServer;

/// Current Unix time from the same clock the server uses.
#[allow(dead_code)]
pub fn now() -> i64 {
    use newsletter_server::clock::{Clock, SystemClock};
    SystemClock.now()
}
