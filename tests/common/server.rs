//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own databases, a recording
//! mailer and a running job scheduler.

use super::constants::*;
use newsletter_server::background_jobs::jobs::EmailQueueProcessorJob;
use newsletter_server::background_jobs::{create_scheduler, JobContext, SchedulerHandle};
use newsletter_server::clock::{Clock, SystemClock};
use newsletter_server::config::{AppConfig, DownloadFile};
use newsletter_server::deliverability::HeaderEnhancer;
use newsletter_server::mailer::{OutgoingEmail, RecordingMailer};
use newsletter_server::newsletter_store::{EmailQueueStore, SqliteNewsletterStore};
use newsletter_server::server::state::{ServerState, Services};
use newsletter_server::server::{make_app, metrics, RequestsLoggingLevel, ServerConfig};
use newsletter_server::server_store::{ServerStore, SqliteServerStore};
use newsletter_server::templates::Templates;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test server instance with isolated databases
///
/// When dropped, the server and the scheduler shut down and temp resources
/// are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Newsletter store for direct database access in tests
    pub newsletter_store: Arc<SqliteNewsletterStore>,

    /// Server store for direct database access in tests
    pub server_store: Arc<dyn ServerStore>,

    /// Every message the server sent
    pub mailer: Arc<RecordingMailer>,

    // Private fields - keep resources alive until drop
    _temp_db_dir: TempDir,
    shutdown_token: CancellationToken,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// # Panics
    ///
    /// Panics if the databases cannot be created, the port cannot be bound or
    /// the server doesn't become ready within the timeout.
    pub async fn spawn() -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        metrics::init_metrics();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Links in mails point straight back at this server
        let mut config = AppConfig::with_defaults(temp_db_dir.path().to_path_buf(), SECRET_KEY);
        config.port = port;
        config.site.url = base_url.clone();
        config.site.name = SITE_NAME.to_string();
        config.admin_token = Some(ADMIN_TOKEN.to_string());
        config.logging_level = RequestsLoggingLevel::None;
        config.downloads.files = vec![DownloadFile {
            post_id: DOWNLOAD_POST_ID,
            block_id: None,
            file_url: DOWNLOAD_FILE_URL.to_string(),
        }];

        let newsletter_store = Arc::new(
            SqliteNewsletterStore::new(config.newsletter_db_path())
                .expect("Failed to open newsletter store"),
        );
        let server_store: Arc<dyn ServerStore> = Arc::new(
            SqliteServerStore::new(config.server_db_path())
                .expect("Failed to create server store"),
        );
        let mailer = Arc::new(RecordingMailer::with_enhancer(HeaderEnhancer::from_config(
            &config,
        )));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let shutdown_token = CancellationToken::new();
        let (hook_sender, hook_receiver) = tokio::sync::mpsc::channel(100);

        let services = Services::new(
            &config,
            newsletter_store.clone(),
            server_store.clone(),
            mailer.clone(),
            clock.clone(),
            Some(hook_sender),
        );

        let job_context = JobContext::new(
            shutdown_token.child_token(),
            server_store.clone(),
            clock.clone(),
        );
        let (mut scheduler, scheduler_handle) = create_scheduler(
            server_store.clone(),
            hook_receiver,
            shutdown_token.clone(),
            job_context,
        );
        // Long interval so only hooks and manual triggers drain the queue
        scheduler
            .register_job(Arc::new(EmailQueueProcessorJob::new(
                services.queue_processor.clone(),
                Duration::from_secs(3600),
            )))
            .await;
        tokio::spawn(async move {
            scheduler.run().await;
        });

        let state = ServerState::new(
            ServerConfig::from(&config),
            newsletter_store.clone(),
            server_store.clone(),
            services,
            Arc::new(Templates::new(&config.site)),
            clock,
            Some(scheduler_handle.clone()),
        );
        let app = make_app(state);

        // Spawn server in background task with graceful shutdown
        let server_shutdown = shutdown_token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            newsletter_store,
            server_store,
            mailer,
            _temp_db_dir: temp_db_dir,
            shutdown_token,
        };

        server.wait_for_ready().await;
        server.wait_for_startup_run(&scheduler_handle).await;

        server
    }

    /// Waits for the server to become ready by polling the /health endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// Waits for the queue worker's startup run to finish, so hooks fired by
    /// the test are not skipped as "already running".
    async fn wait_for_startup_run(&self, scheduler_handle: &SchedulerHandle) {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            let finished = self
                .server_store
                .get_last_run(QUEUE_JOB_ID)
                .expect("Failed to read job history")
                .is_some_and(|run| run.finished_at.is_some());
            if finished && !scheduler_handle.is_job_running(QUEUE_JOB_ID).await {
                return;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Startup queue run did not finish within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }
            tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
        }
    }

    /// Waits until `count` messages were sent to `recipient` and returns them.
    ///
    /// # Panics
    ///
    /// Panics if they don't arrive within MAIL_WAIT_TIMEOUT_MS.
    pub async fn wait_for_mail(&self, recipient: &str, count: usize) -> Vec<OutgoingEmail> {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(MAIL_WAIT_TIMEOUT_MS);

        loop {
            let sent = self.mailer.sent_to(recipient);
            if sent.len() >= count {
                return sent;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Expected {} mails to {} within {}ms, got {}",
                    count,
                    recipient,
                    MAIL_WAIT_TIMEOUT_MS,
                    sent.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
        }
    }

    /// Waits until no queued email is left unsent.
    ///
    /// # Panics
    ///
    /// Panics if the queue isn't drained within MAIL_WAIT_TIMEOUT_MS.
    pub async fn wait_for_queue_drained(&self) {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(MAIL_WAIT_TIMEOUT_MS);

        loop {
            let now = SystemClock.now();
            let stats = self
                .newsletter_store
                .queue_stats(now)
                .expect("Failed to read queue stats");
            if stats.pending == 0 {
                return;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Queue still has {} pending emails after {}ms",
                    stats.pending, MAIL_WAIT_TIMEOUT_MS
                );
            }
            tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Stops both the HTTP server and the scheduler
        self.shutdown_token.cancel();
        // TempDir will be cleaned up automatically
    }
}
