use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import modules from the library crate
use newsletter_server::background_jobs::jobs::{
    DownloadTokenCleanupJob, EmailQueueProcessorJob, TransientCleanupJob,
};
use newsletter_server::background_jobs::{create_scheduler, JobContext};
use newsletter_server::clock::{Clock, SystemClock};
use newsletter_server::config;
use newsletter_server::deliverability::HeaderEnhancer;
use newsletter_server::mailer::create_mailer;
use newsletter_server::newsletter_store::SqliteNewsletterStore;
use newsletter_server::server::state::{ServerState, Services};
use newsletter_server::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig};
use newsletter_server::server_store::{ServerStore, SqliteServerStore};
use newsletter_server::templates::Templates;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (newsletter.db, server.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3002)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Public base URL of the site, used in every link we mail out.
    #[clap(long)]
    pub site_url: Option<String>,

    /// Secret used to sign unsubscribe and verification links.
    #[clap(long)]
    pub secret_key: Option<String>,

    /// Bearer token for the admin API. The admin API is disabled without it.
    #[clap(long)]
    pub admin_token: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            logging_level: args.logging_level.clone(),
            site_url: args.site_url.clone(),
            secret_key: args.secret_key.clone(),
            admin_token: args.admin_token.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  site: {} ({})", app_config.site.name, app_config.site.url);
    info!("  mail transport: {:?}", app_config.mail.transport);
    info!(
        "  admin API: {}",
        if app_config.admin_token.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!(
        "Opening newsletter database at {:?}...",
        app_config.newsletter_db_path()
    );
    let newsletter_store = Arc::new(SqliteNewsletterStore::new(
        app_config.newsletter_db_path(),
    )?);
    let server_store: Arc<dyn ServerStore> =
        Arc::new(SqliteServerStore::new(app_config.server_db_path())?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mailer = create_mailer(
        &app_config.mail,
        HeaderEnhancer::from_config(&app_config),
        &app_config.site.domain(),
    )?;

    // Set up background job scheduler
    let shutdown_token = CancellationToken::new();
    let (hook_sender, hook_receiver) = tokio::sync::mpsc::channel(100);

    let services = Services::new(
        &app_config,
        newsletter_store.clone(),
        server_store.clone(),
        mailer,
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

    // Register jobs
    scheduler
        .register_job(Arc::new(EmailQueueProcessorJob::new(
            services.queue_processor.clone(),
            Duration::from_secs(app_config.queue.process_interval_secs),
        )))
        .await;
    scheduler
        .register_job(Arc::new(DownloadTokenCleanupJob::new(
            services.downloads.clone(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(TransientCleanupJob::new()))
        .await;

    let state = ServerState::new(
        ServerConfig::from(&app_config),
        newsletter_store,
        server_store,
        services,
        Arc::new(Templates::new(&app_config.site)),
        clock,
        Some(scheduler_handle),
    );

    info!("Ready to serve at port {}!", app_config.port);

    // Run HTTP server and job scheduler concurrently
    tokio::select! {
        result = run_server(state, shutdown_token.clone()) => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = scheduler.run() => {
            info!("Scheduler stopped");
            Ok(())
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            // Give the scheduler a moment to shut down gracefully
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }
}
