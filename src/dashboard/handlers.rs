//! HTTP handlers for the API.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_core::Stream;
use futures_util::stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::api::{
    ClearCacheResponse, CommandResponse, DossierQuery, EventsQuery, HealthResponse,
    RunStartedResponse, RunsQuery,
};
use super::error::ApiError;
use super::state::AppState;
use super::stream::{replay_then_tail, sse_event};
use crate::events::PipelineEvent;
use crate::knowledge::{AnalysisView, ChangeLogEntry, KnowledgeRecord};
use crate::pipeline::{Dossier, EntityStatus, Run, RunSummary};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// GET /health
pub async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /api/entities/:entity/stream - Start a run and stream its events.
///
/// Closing the connection does not stop the run.
pub async fn stream_run(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state.orchestrator.start_run(&entity).await?;
    tracing::info!(entity = %handle.entity, run_id = %handle.run_id, "Streaming run");
    let stream = UnboundedReceiverStream::new(handle.events).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/entities/:entity/runs - Start a run in the background.
pub async fn post_run(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<(StatusCode, Json<RunStartedResponse>), ApiError> {
    let handle = state.orchestrator.start_run(&entity).await?;
    let entity = handle.entity.clone();
    let run_id = handle.detach();
    Ok((
        StatusCode::ACCEPTED,
        Json(RunStartedResponse {
            success: true,
            run_id,
            entity,
        }),
    ))
}

/// GET /api/entities
pub async fn get_entities(State(state): State<AppState>) -> ApiResult<Vec<EntityStatus>> {
    Ok(Json(state.orchestrator.list_entities().await?))
}

/// GET /api/entities/:entity/analysis - Latest result projection.
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<AnalysisView> {
    Ok(Json(state.orchestrator.latest_result(&entity).await?))
}

/// GET /api/entities/:entity/knowledge-base
pub async fn get_knowledge_base(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<KnowledgeRecord> {
    Ok(Json(state.orchestrator.knowledge_base(&entity).await?))
}

/// GET /api/entities/:entity/changelog
pub async fn get_changelog(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<Vec<ChangeLogEntry>> {
    Ok(Json(state.orchestrator.change_log(&entity).await?))
}

/// DELETE /api/entities/:entity - Clear an entity's record and run history.
pub async fn delete_entity(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<ClearCacheResponse> {
    let removed = state.orchestrator.clear_cache(&entity).await?;
    Ok(Json(ClearCacheResponse {
        success: true,
        entity: entity.trim().to_string(),
        removed,
    }))
}

/// POST /api/entities/:entity/dossier?topic=
pub async fn post_dossier(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(query): Query<DossierQuery>,
) -> ApiResult<Dossier> {
    Ok(Json(
        state
            .orchestrator
            .generate_dossier(&entity, &query.topic)
            .await?,
    ))
}

/// GET /api/runs?entity=&limit=
pub async fn get_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Vec<RunSummary>> {
    let entity = query.entity.as_deref().map(str::trim).filter(|e| !e.is_empty());
    Ok(Json(
        state
            .orchestrator
            .list_runs(entity, query.effective_limit())
            .await?,
    ))
}

/// GET /api/runs/:run_id
pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> ApiResult<Run> {
    Ok(Json(state.orchestrator.get_run(run_id).await?))
}

/// GET /api/runs/:run_id/events - Recorded event log.
pub async fn get_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<PipelineEvent>> {
    Ok(Json(
        state
            .orchestrator
            .run_events(run_id, query.after_seq)
            .await?,
    ))
}

/// GET /api/runs/:run_id/events/stream - Replay, then tail live.
pub async fn stream_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = replay_then_tail(&state.orchestrator, run_id, query.after_seq).await?;
    let stream = events.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/runs/:run_id/cancel
pub async fn post_cancel(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<CommandResponse> {
    state.orchestrator.cancel(run_id)?;
    Ok(Json(CommandResponse::success("Run cancellation requested")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorPool;
    use crate::config::MarathonConfig;
    use crate::pipeline::{Orchestrator, PipelineError, RunStatus};
    use crate::store::KnowledgeStore;
    use std::time::Duration;

    async fn state() -> AppState {
        let orchestrator = Orchestrator::new(
            KnowledgeStore::open_in_memory().await.unwrap(),
            CollectorPool::new(Vec::new(), Duration::from_secs(1)),
            MarathonConfig::default(),
        );
        AppState::new(orchestrator)
    }

    #[tokio::test]
    async fn test_get_health() {
        let Json(response) = get_health().await;
        assert_eq!(response.status, "ok");
    }

    #[tokio::test]
    async fn test_get_analysis_not_found() {
        let state = state().await;
        let err = get_analysis(State(state), Path("Bedok".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err.0, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reads_after_run() {
        let state = state().await;
        let run = state.orchestrator.run("Bedok").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let Json(view) = get_analysis(State(state.clone()), Path("Bedok".to_string()))
            .await
            .unwrap();
        assert_eq!(view.entity, "Bedok");
        assert_eq!(view.total_runs, 1);

        let Json(entities) = get_entities(State(state.clone())).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert!(entities[0].has_record);
        assert!(!entities[0].running);

        let Json(runs) = get_runs(State(state.clone()), Query(RunsQuery::default()))
            .await
            .unwrap();
        assert_eq!(runs[0].run_id, run.run_id);

        let Json(events) = get_run_events(
            State(state.clone()),
            Path(run.run_id),
            Query(EventsQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(events.last().unwrap().event_type(), "run_completed");

        let Json(detail) = get_run(State(state), Path(run.run_id)).await.unwrap();
        assert_eq!(detail.run_number, 1);
    }

    #[tokio::test]
    async fn test_delete_entity_is_idempotent() {
        let state = state().await;
        state.orchestrator.run("Bedok").await.unwrap();

        let Json(first) = delete_entity(State(state.clone()), Path("Bedok".to_string()))
            .await
            .unwrap();
        assert!(first.removed);
        let Json(second) = delete_entity(State(state.clone()), Path("Bedok".to_string()))
            .await
            .unwrap();
        assert!(second.success);
        assert!(!second.removed);

        let Json(runs) = get_runs(State(state), Query(RunsQuery::default()))
            .await
            .unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let state = state().await;
        let err = post_cancel(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err.0, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dossier_without_record_is_not_found() {
        let state = state().await;
        let err = post_dossier(
            State(state),
            Path("Bedok".to_string()),
            Query(DossierQuery {
                topic: "Gym".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.0, PipelineError::NotFound(_)));
    }
}
