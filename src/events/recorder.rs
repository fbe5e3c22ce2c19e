//! Per-run event recording.

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::store::KnowledgeStore;

use super::{EventDetail, EventHub, LogLevel, NodeStatus, PipelineEvent};

/// Stamps, persists and publishes the events of one run.
///
/// Events are appended to the store before they are published, so anything
/// a live subscriber has seen can be replayed from the log.
#[derive(Debug)]
pub struct RunRecorder {
    run_id: Uuid,
    seq: u64,
    store: KnowledgeStore,
    hub: EventHub,
    direct: Option<mpsc::UnboundedSender<PipelineEvent>>,
    lost: u64,
}

impl RunRecorder {
    #[must_use]
    pub fn new(run_id: Uuid, store: KnowledgeStore, hub: EventHub) -> Self {
        Self {
            run_id,
            seq: 0,
            store,
            hub,
            direct: None,
            lost: 0,
        }
    }

    /// Also deliver every event to a dedicated lossless channel.
    #[must_use]
    pub fn with_direct(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.direct = Some(tx);
        self
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Sequence number of the last emitted event.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Events delivered live that are missing from the stored log.
    #[must_use]
    pub fn lost_events(&self) -> u64 {
        self.lost
    }

    /// Record one event.
    ///
    /// A failed append is logged and counted in [`RunRecorder::lost_events`];
    /// delivery still happens. The orchestrator fails the run once too many
    /// events are lost.
    pub async fn emit(&mut self, node: &str, detail: EventDetail) -> PipelineEvent {
        self.seq += 1;
        let event = PipelineEvent {
            run_id: self.run_id,
            seq: self.seq,
            timestamp: Utc::now(),
            node: node.to_string(),
            detail,
        };

        if let Err(e) = self.store.append_event(&event).await {
            self.lost += 1;
            tracing::warn!(
                run_id = %self.run_id,
                seq = event.seq,
                lost = self.lost,
                error = %e,
                "Failed to persist run event"
            );
        }

        if let Some(tx) = &self.direct {
            if tx.send(event.clone()).is_err() {
                // Receiver gone: the caller stopped watching, the run goes on.
                self.direct = None;
            }
        }
        self.hub.publish(event.clone());
        event
    }

    pub async fn node_started(&mut self, node: &str, message: Option<String>) {
        self.emit(node, EventDetail::NodeStarted { message }).await;
    }

    pub async fn node_completed(&mut self, node: &str, summary: impl Into<String>) {
        self.emit(
            node,
            EventDetail::NodeCompleted {
                status: NodeStatus::Completed,
                summary: Some(summary.into()),
                reason: None,
            },
        )
        .await;
    }

    pub async fn node_skipped(&mut self, node: &str, reason: impl Into<String>) {
        self.emit(
            node,
            EventDetail::NodeCompleted {
                status: NodeStatus::Skipped,
                summary: None,
                reason: Some(reason.into()),
            },
        )
        .await;
    }

    pub async fn node_failed(&mut self, node: &str, reason: impl Into<String>) {
        self.emit(
            node,
            EventDetail::NodeCompleted {
                status: NodeStatus::Failed,
                summary: None,
                reason: Some(reason.into()),
            },
        )
        .await;
    }

    pub async fn log(&mut self, node: &str, level: LogLevel, message: impl Into<String>) {
        self.emit(
            node,
            EventDetail::AgentLog {
                level,
                message: message.into(),
            },
        )
        .await;
    }
}
