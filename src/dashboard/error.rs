//! Dashboard error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::api::CommandResponse;
use crate::pipeline::PipelineError;

/// Errors that can occur while running the dashboard server.
#[derive(thiserror::Error, Debug)]
pub enum DashboardError {
    /// Failed to bind to address.
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Server error.
    #[error("Server error: {0}")]
    ServerError(String),
}

/// A pipeline error rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status and summary message for the wrapped error.
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            PipelineError::Conflict { .. } => (StatusCode::CONFLICT, "Run already in progress"),
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            PipelineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            PipelineError::Dossier(_) | PipelineError::Reevaluation(_) => {
                (StatusCode::BAD_GATEWAY, "Generation failed")
            }
            PipelineError::Store(_)
            | PipelineError::Cancelled
            | PipelineError::EventLog { .. }
            | PipelineError::StagePanicked(_)
            | PipelineError::TaskFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(CommandResponse::error(message, self.0.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GenerationError;
    use crate::store::StoreError;

    #[test]
    fn test_bind_error_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let error = DashboardError::BindError {
            address: "127.0.0.1:8000".to_string(),
            source: io_error,
        };
        assert!(error
            .to_string()
            .contains("Failed to bind to 127.0.0.1:8000"));
        assert!(error.to_string().contains("address in use"));
    }

    #[test]
    fn test_status_mapping() {
        let conflict = ApiError(PipelineError::Conflict {
            entity: "Bedok".into(),
            run_id: None,
        });
        assert_eq!(conflict.status().0, StatusCode::CONFLICT);
        assert_eq!(
            ApiError(PipelineError::NotFound("run".into())).status().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(PipelineError::Dossier(GenerationError::Request("x".into())))
                .status()
                .0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError(PipelineError::Store(StoreError::TaskCancelled)).status().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError(PipelineError::InvalidInput("topic is empty".into()))
                .status()
                .0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_response_status() {
        let response = ApiError(PipelineError::NotFound("knowledge base for Bedok".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
