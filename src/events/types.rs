//! Wire types of the run event protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::FetchStatus;
use crate::knowledge::Delta;
use crate::pipeline::{Directive, ToolCall};

/// Status of a node as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

/// Severity of an agent log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "detail", rename_all = "snake_case")]
pub enum EventDetail {
    RunStarted {
        entity: String,
        run_number: u64,
        directive: Directive,
    },
    NodeStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ToolResult(ToolCall),
    AgentLog {
        level: LogLevel,
        message: String,
    },
    NodeCompleted {
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DeltaDetected(Delta),
    VerificationFlag {
        category: String,
        source_id: String,
        fetch_status: FetchStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        summary: String,
        delta_count: usize,
        high_delta_count: usize,
        reevaluated: bool,
    },
    RunFailed {
        error: String,
    },
}

impl EventDetail {
    /// The `event_type` tag as written on the wire.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::ToolResult(_) => "tool_result",
            Self::AgentLog { .. } => "agent_log",
            Self::NodeCompleted { .. } => "node_completed",
            Self::DeltaDetected(_) => "delta_detected",
            Self::VerificationFlag { .. } => "verification_flag",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    /// Whether this event ends a run's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}

/// One observable step of a run.
///
/// `seq` is strictly increasing within a run, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub run_id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub node: String,
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl PipelineEvent {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.detail.event_type()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.detail.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(detail: EventDetail) -> PipelineEvent {
        PipelineEvent {
            run_id: Uuid::new_v4(),
            seq: 1,
            timestamp: Utc::now(),
            node: "strategist".into(),
            detail,
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let e = event(EventDetail::NodeCompleted {
            status: NodeStatus::Skipped,
            summary: None,
            reason: Some("No HIGH significance changes".into()),
        });
        let json = serde_json::to_value(&e).unwrap();

        assert_eq!(json["event_type"], "node_completed");
        assert_eq!(json["node"], "strategist");
        assert_eq!(json["detail"]["status"], "skipped");
        assert_eq!(json["detail"]["reason"], "No HIGH significance changes");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_event_type_matches_serialized_tag() {
        let details = vec![
            EventDetail::NodeStarted { message: None },
            EventDetail::AgentLog {
                level: LogLevel::Warn,
                message: "x".into(),
            },
            EventDetail::RunFailed {
                error: "boom".into(),
            },
        ];
        for detail in details {
            let e = event(detail);
            let json = serde_json::to_value(&e).unwrap();
            assert_eq!(json["event_type"], e.event_type());
        }
    }

    #[test]
    fn test_event_deserializes_from_wire() {
        let e = event(EventDetail::RunCompleted {
            summary: "Run #1 complete.".into(),
            delta_count: 2,
            high_delta_count: 1,
            reevaluated: true,
        });
        let text = serde_json::to_string(&e).unwrap();
        let parsed: PipelineEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, e);
        assert!(parsed.is_terminal());
    }
}
