//! Shutdown coordination for abnormal termination.
//!
//! Armed before any worker launches: if the dispatching process is
//! interrupted, every live worker gets the configured stop signal instead
//! of being orphaned, and the dispatch token is cancelled so pending
//! result waits abort. Disarmed as soon as the dispatch completes
//! normally.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::StopModeConfig;
use crate::worker::WorkerRegistry;

/// The armed cleanup action for one dispatch.
pub struct ShutdownCoordinator {
    listener: JoinHandle<()>,
}

impl ShutdownCoordinator {
    /// Arm the coordinator: on interrupt, broadcast the stop mode to every
    /// live worker and cancel the dispatch token.
    pub fn arm(
        registry: Arc<WorkerRegistry>,
        mode: StopModeConfig,
        dispatch_token: CancellationToken,
    ) -> Self {
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; signalling live workers to stop");
                registry.broadcast_stop(mode);
                dispatch_token.cancel();
            }
        });

        Self { listener }
    }

    /// Disarm on normal completion; the cleanup action never fires.
    pub fn disarm(self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disarm_leaves_token_untouched() {
        let registry = Arc::new(WorkerRegistry::new());
        let token = CancellationToken::new();

        let coordinator = ShutdownCoordinator::arm(registry, StopModeConfig::Halt, token.clone());
        coordinator.disarm();

        assert!(!token.is_cancelled());
    }
}
