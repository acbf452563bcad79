use crate::clock::Clock;
use crate::server_store::ServerStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Access to server-side state (job history, schedules, transients).
    pub server_store: Arc<dyn ServerStore>,

    pub clock: Arc<dyn Clock>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        server_store: Arc<dyn ServerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cancellation_token,
            server_store,
            clock,
        }
    }

    /// Same resources with a different cancellation token.
    pub fn with_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            server_store: Arc::clone(&self.server_store),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
