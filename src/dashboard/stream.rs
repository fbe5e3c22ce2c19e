//! Event streams for SSE clients: replay the recorded log, then tail live.

use std::collections::VecDeque;

use axum::response::sse::Event;
use futures_core::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

use crate::events::PipelineEvent;
use crate::pipeline::{Orchestrator, PipelineError};

/// Render a pipeline event as an SSE frame named by its `event_type`.
#[must_use]
pub fn sse_event(event: &PipelineEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .event(event.event_type())
        .id(event.seq.to_string())
        .data(data)
}

struct Tail {
    orchestrator: Orchestrator,
    run_id: Uuid,
    live: Receiver<PipelineEvent>,
    backlog: VecDeque<PipelineEvent>,
    last_seq: u64,
    done: bool,
}

impl Tail {
    async fn next(&mut self) -> Option<PipelineEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                if event.is_terminal() {
                    self.done = true;
                    self.backlog.clear();
                }
                return Some(event);
            }
            if self.done {
                return None;
            }

            match self.live.recv().await {
                Ok(event) if event.run_id == self.run_id => self.backlog.push_back(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %self.run_id, skipped, "Live tail lagged, reading log");
                    match self
                        .orchestrator
                        .run_events(self.run_id, self.last_seq)
                        .await
                    {
                        Ok(events) => self.backlog.extend(events),
                        Err(e) => {
                            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to read run events");
                            return None;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Events of a run after `after_seq`: the recorded log first, then live
/// events until the terminal one. Each `seq` is yielded at most once.
///
/// # Errors
///
/// Returns `NotFound` if the run does not exist.
pub async fn replay_then_tail(
    orchestrator: &Orchestrator,
    run_id: Uuid,
    after_seq: u64,
) -> Result<impl Stream<Item = PipelineEvent> + Send + 'static, PipelineError> {
    // Subscribe before reading the log so nothing falls between the two.
    let live = orchestrator.subscribe();
    let run = orchestrator.get_run(run_id).await?;
    let replay = orchestrator.run_events(run_id, after_seq).await?;

    let finished = replay.iter().any(PipelineEvent::is_terminal)
        || (run.status.is_terminal() && orchestrator.active_run(&run.entity) != Some(run_id));

    let tail = Tail {
        orchestrator: orchestrator.clone(),
        run_id,
        live,
        backlog: replay.into(),
        last_seq: after_seq,
        done: finished,
    };

    Ok(futures_util::stream::unfold(tail, |mut tail| async move {
        tail.next().await.map(|event| (event, tail))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorPool;
    use crate::config::MarathonConfig;
    use crate::store::KnowledgeStore;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            KnowledgeStore::open_in_memory().await.unwrap(),
            CollectorPool::new(Vec::new(), Duration::from_secs(1)),
            MarathonConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_replay_of_finished_run_ends_at_terminal_event() {
        let orchestrator = orchestrator().await;
        let run = orchestrator.run("Bedok").await.unwrap();

        let events: Vec<PipelineEvent> = replay_then_tail(&orchestrator, run.run_id, 0)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.first().unwrap().event_type(), "run_started");
        assert_eq!(events.last().unwrap().event_type(), "run_completed");
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_resume_after_seq() {
        let orchestrator = orchestrator().await;
        let run = orchestrator.run("Bedok").await.unwrap();

        let events: Vec<PipelineEvent> = replay_then_tail(&orchestrator, run.run_id, 3)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.first().unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let orchestrator = orchestrator().await;
        let result = replay_then_tail(&orchestrator, Uuid::new_v4(), 0).await;
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_sse_event_builds() {
        let event = PipelineEvent {
            run_id: Uuid::new_v4(),
            seq: 7,
            timestamp: chrono::Utc::now(),
            node: "persist".into(),
            detail: crate::events::EventDetail::NodeStarted { message: None },
        };
        let _frame = sse_event(&event);
    }
}
