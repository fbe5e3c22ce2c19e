//! Client-side reduction of the event stream into a run view.
//!
//! A view built from the live stream and one built by replaying the stored
//! events of the same run are equal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::FetchStatus;
use crate::knowledge::Delta;
use crate::pipeline::{Directive, ToolCall};

use super::{EventDetail, LogLevel, NodeStatus, PipelineEvent};

/// Overall state of the reduced run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunViewStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Projection of one node of the run graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub status: NodeStatus,
    pub summary: Option<String>,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tool_calls: Vec<ToolCall>,
    pub logs: Vec<LogLine>,
}

impl NodeState {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagView {
    pub category: String,
    pub source_id: String,
    pub fetch_status: FetchStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything a client knows about one run.
///
/// Events are applied strictly in `seq` order. An event ahead of the next
/// expected one is held back until the gap is filled, typically by
/// re-fetching the log from [`RunView::resume_after`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: Option<Uuid>,
    pub entity: Option<String>,
    pub run_number: Option<u64>,
    pub directive: Option<Directive>,
    pub status: RunViewStatus,
    pub nodes: BTreeMap<String, NodeState>,
    pub deltas: Vec<Delta>,
    pub flags: Vec<FlagView>,
    pub summary: Option<String>,
    pub error: Option<String>,
    /// Highest sequence number applied; every lower one was applied too.
    pub last_seq: u64,
    #[serde(skip)]
    held: BTreeMap<u64, PipelineEvent>,
}

impl RunView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from stored events.
    #[must_use]
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a PipelineEvent>) -> Self {
        let mut view = Self::new();
        for event in events {
            view.apply(event);
        }
        view
    }

    /// Apply one event. Returns `false` if it was ignored as a duplicate or
    /// as belonging to another run.
    pub fn apply(&mut self, event: &PipelineEvent) -> bool {
        let starts_new_run = matches!(event.detail, EventDetail::RunStarted { .. })
            && self.run_id != Some(event.run_id);

        if starts_new_run {
            *self = Self::new();
        } else if self.run_id.is_some_and(|current| current != event.run_id) {
            return false;
        }
        if event.seq <= self.last_seq || self.held.contains_key(&event.seq) {
            return false;
        }

        self.run_id = Some(event.run_id);
        if event.seq != self.last_seq + 1 {
            self.held.insert(event.seq, event.clone());
            return true;
        }

        self.reduce(event);
        while let Some(next) = self.held.remove(&(self.last_seq + 1)) {
            self.reduce(&next);
        }
        true
    }

    /// The `after_seq` to re-fetch from when events are missing, or `None`
    /// when the view is contiguous.
    #[must_use]
    pub fn resume_after(&self) -> Option<u64> {
        if self.held.is_empty() {
            None
        } else {
            Some(self.last_seq)
        }
    }

    /// Every tool call of the run, grouped by node.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.nodes.values().flat_map(|node| node.tool_calls.iter())
    }

    fn reduce(&mut self, event: &PipelineEvent) {
        self.last_seq = event.seq;
        if self.status == RunViewStatus::Idle {
            self.status = RunViewStatus::Running;
        }

        match &event.detail {
            EventDetail::RunStarted {
                entity,
                run_number,
                directive,
            } => {
                self.entity = Some(entity.clone());
                self.run_number = Some(*run_number);
                self.directive = Some(*directive);
            }
            EventDetail::NodeStarted { message } => {
                let node = self.node_mut(&event.node);
                node.status = NodeStatus::Running;
                node.started_at = Some(event.timestamp);
                if let Some(message) = message {
                    node.summary = Some(message.clone());
                }
            }
            EventDetail::ToolResult(call) => {
                let node = self.node_mut(&event.node);
                if node.status == NodeStatus::Pending {
                    node.status = NodeStatus::Running;
                }
                node.tool_calls.push(call.clone());
            }
            EventDetail::AgentLog { level, message } => {
                self.node_mut(&event.node).logs.push(LogLine {
                    level: *level,
                    message: message.clone(),
                    timestamp: event.timestamp,
                });
            }
            EventDetail::NodeCompleted {
                status,
                summary,
                reason,
            } => {
                let node = self.node_mut(&event.node);
                node.status = match status {
                    NodeStatus::Pending | NodeStatus::Running => NodeStatus::Completed,
                    other => *other,
                };
                node.finished_at = Some(event.timestamp);
                if summary.is_some() {
                    node.summary.clone_from(summary);
                }
                node.reason.clone_from(reason);
            }
            EventDetail::DeltaDetected(delta) => self.deltas.push(delta.clone()),
            EventDetail::VerificationFlag {
                category,
                source_id,
                fetch_status,
                error,
            } => self.flags.push(FlagView {
                category: category.clone(),
                source_id: source_id.clone(),
                fetch_status: *fetch_status,
                error: error.clone(),
            }),
            EventDetail::RunCompleted { summary, .. } => {
                self.status = RunViewStatus::Completed;
                self.summary = Some(summary.clone());
            }
            EventDetail::RunFailed { error } => {
                self.status = RunViewStatus::Failed;
                self.error = Some(error.clone());
                for node in self.nodes.values_mut() {
                    if node.status == NodeStatus::Running {
                        node.status = NodeStatus::Failed;
                        node.finished_at = Some(event.timestamp);
                    }
                }
            }
        }
    }

    fn node_mut(&mut self, node: &str) -> &mut NodeState {
        self.nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeState::new(node))
    }

    /// Whether the run reached a terminal event.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RunViewStatus::Completed | RunViewStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Script {
        run_id: Uuid,
        seq: u64,
        events: Vec<PipelineEvent>,
    }

    impl Script {
        fn new() -> Self {
            Self {
                run_id: Uuid::new_v4(),
                seq: 0,
                events: Vec::new(),
            }
        }

        fn push(&mut self, node: &str, detail: EventDetail) -> &mut Self {
            self.seq += 1;
            self.events.push(PipelineEvent {
                run_id: self.run_id,
                seq: self.seq,
                timestamp: Utc::now(),
                node: node.to_string(),
                detail,
            });
            self
        }
    }

    fn started() -> EventDetail {
        EventDetail::RunStarted {
            entity: "Bedok".into(),
            run_number: 2,
            directive: Directive::Incremental,
        }
    }

    fn completed(status: NodeStatus, reason: Option<&str>) -> EventDetail {
        EventDetail::NodeCompleted {
            status,
            summary: None,
            reason: reason.map(String::from),
        }
    }

    #[test]
    fn test_node_lifecycle() {
        let mut script = Script::new();
        script
            .push("marathon", started())
            .push("delta_detector", EventDetail::NodeStarted { message: None })
            .push("delta_detector", completed(NodeStatus::Completed, None))
            .push(
                "strategist",
                completed(NodeStatus::Skipped, Some("No HIGH significance changes")),
            );

        let view = RunView::replay(&script.events);

        assert_eq!(view.entity.as_deref(), Some("Bedok"));
        assert_eq!(view.run_number, Some(2));
        assert_eq!(view.nodes["delta_detector"].status, NodeStatus::Completed);
        assert_eq!(view.nodes["strategist"].status, NodeStatus::Skipped);
        assert_eq!(
            view.nodes["strategist"].reason.as_deref(),
            Some("No HIGH significance changes")
        );
        assert_eq!(view.status, RunViewStatus::Running);
    }

    #[test]
    fn test_duplicate_and_stale_events_are_ignored() {
        let mut script = Script::new();
        script
            .push("marathon", started())
            .push("persist", EventDetail::NodeStarted { message: None });

        let mut view = RunView::new();
        assert!(view.apply(&script.events[0]));
        assert!(view.apply(&script.events[1]));
        assert!(!view.apply(&script.events[1]));
        assert!(!view.apply(&script.events[0]));
        assert_eq!(view.last_seq, 2);
    }

    #[test]
    fn test_run_started_resets_state() {
        let mut first = Script::new();
        first
            .push("marathon", started())
            .push("marathon", EventDetail::RunFailed { error: "x".into() });
        let mut second = Script::new();
        second.push("marathon", started());

        let mut view = RunView::replay(&first.events);
        assert_eq!(view.status, RunViewStatus::Failed);

        assert!(view.apply(&second.events[0]));
        assert_eq!(view.run_id, Some(second.run_id));
        assert_eq!(view.status, RunViewStatus::Running);
        assert!(view.error.is_none());

        // Late events from the old run no longer apply.
        let mut late = first.events[1].clone();
        late.seq = 10;
        assert!(!view.apply(&late));
    }

    #[test]
    fn test_tool_calls_and_logs_belong_to_their_node() {
        let mut script = Script::new();
        script
            .push("marathon", started())
            .push("tender_scanner", EventDetail::NodeStarted { message: None })
            .push(
                "tender_scanner",
                EventDetail::ToolResult(ToolCall {
                    collector: "tender_scanner".into(),
                    source_id: "gebiz".into(),
                    fetch_status: FetchStatus::Unavailable,
                    error: Some("http_503".into()),
                    raw_url: None,
                }),
            )
            .push(
                "tender_scanner",
                EventDetail::AgentLog {
                    level: LogLevel::Warn,
                    message: "gebiz returned 503".into(),
                },
            );

        let view = RunView::replay(&script.events);
        let node = &view.nodes["tender_scanner"];
        assert_eq!(node.id, "tender_scanner");
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.tool_calls[0].source_id, "gebiz");
        assert_eq!(node.logs[0].message, "gebiz returned 503");
        assert_eq!(view.tool_calls().count(), 1);
        assert!(!view.nodes.contains_key("marathon"));
    }

    #[test]
    fn test_missed_event_is_filled_by_refetch() {
        let mut script = Script::new();
        script
            .push("marathon", started())
            .push("marathon_observer", EventDetail::NodeStarted { message: None })
            .push(
                "marathon_observer",
                EventDetail::AgentLog {
                    level: LogLevel::Info,
                    message: "no prior record".into(),
                },
            )
            .push("marathon_observer", completed(NodeStatus::Completed, None))
            .push(
                "marathon",
                EventDetail::RunCompleted {
                    summary: "done".into(),
                    delta_count: 0,
                    high_delta_count: 0,
                    reevaluated: false,
                },
            );

        let mut view = RunView::new();
        for (i, event) in script.events.iter().enumerate() {
            if i != 2 {
                assert!(view.apply(event));
            }
        }
        assert_eq!(view.last_seq, 2);
        assert_eq!(view.resume_after(), Some(2));
        assert!(!view.is_finished());

        for event in script.events.iter().skip(2) {
            view.apply(event);
        }
        assert_eq!(view.resume_after(), None);
        assert_eq!(view, RunView::replay(&script.events));
        assert_eq!(view.nodes["marathon_observer"].logs.len(), 1);
    }

    #[test]
    fn test_run_failed_marks_running_nodes_failed() {
        let mut script = Script::new();
        script
            .push("marathon", started())
            .push("persist", EventDetail::NodeStarted { message: None })
            .push(
                "marathon",
                EventDetail::RunFailed {
                    error: "store unavailable".into(),
                },
            );

        let view = RunView::replay(&script.events);
        assert!(view.is_finished());
        assert_eq!(view.nodes["persist"].status, NodeStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("store unavailable"));
    }
}
