use axum::extract::FromRef;

use crate::background_jobs::{HookEvent, SchedulerHandle};
use crate::broadcast::BroadcastService;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::downloads::DownloadService;
use crate::mailer::Mailer;
use crate::newsletter_store::FullNewsletterStore;
use crate::queue_worker::EmailQueueProcessor;
use crate::server_store::ServerStore;
use crate::templates::Templates;
use crate::unsubscribe::{UnsubscribeLinks, UnsubscribeService};
use crate::verification::VerificationService;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::ServerConfig;

pub type GuardedNewsletterStore = Arc<dyn FullNewsletterStore>;
pub type GuardedServerStore = Arc<dyn ServerStore>;
pub type OptionalSchedulerHandle = Option<SchedulerHandle>;
pub type GuardedTemplates = Arc<Templates>;

/// The domain services behind the HTTP routes and the background jobs.
#[derive(Clone)]
pub struct Services {
    pub verification: Arc<VerificationService>,
    pub unsubscribe: Arc<UnsubscribeService>,
    pub downloads: Arc<DownloadService>,
    pub broadcast: Arc<BroadcastService>,
    pub queue_processor: Arc<EmailQueueProcessor>,
}

impl Services {
    pub fn new<S: FullNewsletterStore + 'static>(
        config: &AppConfig,
        store: Arc<S>,
        server_store: GuardedServerStore,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        hook_sender: Option<mpsc::Sender<HookEvent>>,
    ) -> Self {
        let newsletter_store: GuardedNewsletterStore = store.clone();
        Services {
            verification: Arc::new(VerificationService::new(
                newsletter_store.clone(),
                server_store.clone(),
                clock.clone(),
                config,
            )),
            unsubscribe: Arc::new(UnsubscribeService::new(
                store,
                server_store.clone(),
                clock.clone(),
                UnsubscribeLinks::from_config(config),
            )),
            downloads: Arc::new(DownloadService::new(
                newsletter_store.clone(),
                server_store.clone(),
                mailer.clone(),
                clock.clone(),
                config,
            )),
            broadcast: Arc::new(BroadcastService::new(
                newsletter_store.clone(),
                server_store.clone(),
                clock.clone(),
                config,
                hook_sender,
            )),
            queue_processor: Arc::new(EmailQueueProcessor::new(
                newsletter_store,
                server_store,
                mailer,
                clock,
                config,
            )),
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub hash: String,
    pub newsletter_store: GuardedNewsletterStore,
    pub server_store: GuardedServerStore,
    pub services: Services,
    pub templates: GuardedTemplates,
    pub clock: Arc<dyn Clock>,
    pub scheduler_handle: OptionalSchedulerHandle,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedNewsletterStore {
    fn from_ref(input: &ServerState) -> Self {
        input.newsletter_store.clone()
    }
}

impl FromRef<ServerState> for GuardedServerStore {
    fn from_ref(input: &ServerState) -> Self {
        input.server_store.clone()
    }
}

impl FromRef<ServerState> for Services {
    fn from_ref(input: &ServerState) -> Self {
        input.services.clone()
    }
}

impl FromRef<ServerState> for GuardedTemplates {
    fn from_ref(input: &ServerState) -> Self {
        input.templates.clone()
    }
}

impl FromRef<ServerState> for OptionalSchedulerHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler_handle.clone()
    }
}
