//! Pipeline error types.

use uuid::Uuid;

use crate::store::StoreError;

use super::GenerationError;

/// Errors surfaced by the run orchestrator and its read operations.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A run is already active for the entity.
    #[error("A run is already active for {entity}")]
    Conflict {
        entity: String,
        /// The in-flight run, once it has been registered.
        run_id: Option<Uuid>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller-supplied entity or topic is unusable.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Re-evaluation failed: {0}")]
    Reevaluation(#[source] GenerationError),

    #[error("Dossier generation failed: {0}")]
    Dossier(#[source] GenerationError),

    #[error("run cancelled")]
    Cancelled,

    /// Too many events failed to reach the stored log for replay to be trusted.
    #[error("Event log unavailable: {lost} events not persisted")]
    EventLog { lost: u64 },

    /// A stage panicked; the run is failed like any other stage error.
    #[error("Stage panicked: {0}")]
    StagePanicked(String),

    #[error("Run task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Whether this error should be surfaced as a conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
