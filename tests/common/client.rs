//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all newsletter-server endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::header::AUTHORIZATION;
use reqwest::redirect::Policy;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client. Redirects are not followed so tests can assert on them.
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    /// GET on an absolute URL, typically a link taken from a mail.
    pub async fn follow_link(&self, url: &str) -> Response {
        self.client
            .get(url)
            .send()
            .await
            .expect("Link request failed")
    }

    // ========================================================================
    // Public Endpoints
    // ========================================================================

    pub async fn health(&self) -> Response {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .expect("Health request failed")
    }

    /// Submits the subscribe form as urlencoded data.
    pub async fn subscribe(&self, email: &str) -> Response {
        self.client
            .post(format!("{}/subscribe", self.base_url))
            .form(&[("email", email)])
            .send()
            .await
            .expect("Subscribe request failed")
    }

    /// One-click unsubscribe, as sent by mail clients.
    pub async fn one_click_unsubscribe(&self, url: &str) -> Response {
        self.client
            .post(url)
            .form(&[("List-Unsubscribe", "One-Click")])
            .send()
            .await
            .expect("One-click unsubscribe request failed")
    }

    /// Submits the gated download form.
    pub async fn request_download(&self, email: &str, post_id: i64) -> Response {
        self.client
            .post(format!("{}/download", self.base_url))
            .form(&[
                ("EMAIL", email.to_string()),
                ("postId", post_id.to_string()),
                ("blockId", String::new()),
            ])
            .send()
            .await
            .expect("Download request failed")
    }

    // ========================================================================
    // Admin Endpoints
    // ========================================================================

    fn admin_url(&self, path: &str) -> String {
        format!("{}/v1/admin{}", self.base_url, path)
    }

    pub async fn admin_get(&self, path: &str) -> Response {
        self.client
            .get(self.admin_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .send()
            .await
            .expect("Admin GET request failed")
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> Response {
        self.client
            .post(self.admin_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .json(&body)
            .send()
            .await
            .expect("Admin POST request failed")
    }

    pub async fn admin_delete(&self, path: &str) -> Response {
        self.client
            .delete(self.admin_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .send()
            .await
            .expect("Admin DELETE request failed")
    }

    /// Admin GET without credentials.
    pub async fn anonymous_admin_get(&self, path: &str) -> Response {
        self.client
            .get(self.admin_url(path))
            .send()
            .await
            .expect("Admin GET request failed")
    }

    pub async fn trigger_job(&self, job_id: &str) -> Response {
        self.admin_post(&format!("/jobs/{}/trigger", job_id), json!({}))
            .await
    }

    pub async fn broadcast(&self, post_id: i64, title: &str, recipients: Option<&[&str]>) -> Response {
        let mut body = json!({
            "post_id": post_id,
            "title": title,
            "url": format!("{}/posts/{}", self.base_url, post_id),
            "excerpt": "A short summary of the post.",
            "published_at": 1_700_000_000,
        });
        if let Some(recipients) = recipients {
            body["recipients"] = json!(recipients);
        }
        self.admin_post("/broadcast", body).await
    }
}
