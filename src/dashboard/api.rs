//! Request and response types for the HTTP API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic result of a command endpoint, also used for error bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command was successful.
    pub success: bool,
    /// Message describing the result.
    pub message: String,
    /// Optional error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    /// Create a success response.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Response for POST /api/entities/:entity/runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedResponse {
    pub success: bool,
    pub run_id: Uuid,
    pub entity: String,
}

/// Response for DELETE /api/entities/:entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub entity: String,
    /// False if there was nothing to clear.
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Query parameters for GET /api/runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl RunsQuery {
    /// Get the effective limit, capped at `MAX_RUNS_LIMIT`.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_RUNS_LIMIT)
    }
}

impl Default for RunsQuery {
    fn default() -> Self {
        Self {
            entity: None,
            limit: default_limit(),
        }
    }
}

/// Maximum allowed limit for run listings.
pub const MAX_RUNS_LIMIT: usize = 500;

const fn default_limit() -> usize {
    20
}

/// Query parameters for the run event endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a greater sequence number are returned.
    #[serde(default)]
    pub after_seq: u64,
}

/// Query parameters for POST /api/entities/:entity/dossier.
#[derive(Debug, Clone, Deserialize)]
pub struct DossierQuery {
    pub topic: String,
}
