//! HTTP server with axum router and graceful shutdown.

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::DashboardError;
use super::handlers::{
    delete_entity, get_analysis, get_changelog, get_entities, get_health, get_knowledge_base,
    get_run, get_run_events, get_runs, post_cancel, post_dossier, post_run, stream_run,
    stream_run_events,
};
use super::state::AppState;
use crate::config::ServerConfig;

/// HTTP server exposing runs, knowledge and event streams.
#[derive(Debug)]
pub struct DashboardServer {
    config: ServerConfig,
    state: AppState,
}

impl DashboardServer {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            config: ServerConfig::default(),
            state,
        }
    }

    /// Set the server configuration (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the configured address as a string.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Build the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(get_health))
            .route("/api/entities", get(get_entities))
            .route("/api/entities/:entity", axum::routing::delete(delete_entity))
            .route("/api/entities/:entity/stream", get(stream_run))
            .route("/api/entities/:entity/runs", post(post_run))
            .route("/api/entities/:entity/analysis", get(get_analysis))
            .route("/api/entities/:entity/knowledge-base", get(get_knowledge_base))
            .route("/api/entities/:entity/changelog", get(get_changelog))
            .route("/api/entities/:entity/dossier", post(post_dossier))
            .route("/api/runs", get(get_runs))
            .route("/api/runs/:run_id", get(get_run))
            .route("/api/runs/:run_id/events", get(get_run_events))
            .route("/api/runs/:run_id/events/stream", get(stream_run_events))
            .route("/api/runs/:run_id/cancel", post(post_cancel))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Run the server until the state's cancellation token fires.
    ///
    /// In-flight runs are not interrupted by shutdown of the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(self) -> Result<(), DashboardError> {
        let addr = self.address();
        let cancel = self.state.cancel.clone();
        let app = self.build_router();

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DashboardError::BindError {
                address: addr.clone(),
                source,
            })?;
        tracing::info!(address = %addr, "Starting server");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                tracing::info!("Server shutting down gracefully");
            })
            .await
            .map_err(|e| DashboardError::ServerError(e.to_string()))
    }
}
