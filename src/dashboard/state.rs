//! Shared handler state.

use tokio_util::sync::CancellationToken;

use crate::pipeline::Orchestrator;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Cancelled to shut the server down gracefully.
    pub cancel: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(orchestrator: Orchestrator, cancel: CancellationToken) -> Self {
        Self {
            orchestrator,
            cancel,
        }
    }
}
