//! Run types shared by the orchestrator, the store and the event protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::{FetchStatus, ProvenanceEnvelope};
use crate::knowledge::{Delta, Significance};

/// Node id of the scoping stage.
pub const SCOPE_NODE: &str = "marathon_observer";
/// Node id of the source verifier.
pub const VERIFIER_NODE: &str = "source_verifier";
/// Node id of the delta detector.
pub const DELTA_NODE: &str = "delta_detector";
/// Node id of the knowledge integrator.
pub const INTEGRATOR_NODE: &str = "knowledge_integrator";
/// Node id of the conditional re-evaluation stage.
pub const REEVALUATION_NODE: &str = "strategist";
/// Node id of the persist stage.
pub const PERSIST_NODE: &str = "persist";
/// Node id used for run-level events.
pub const RUN_NODE: &str = "marathon";

/// How much of the entity is re-investigated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// No usable knowledge exists; investigate everything.
    ColdStart,
    /// Refresh what is due and diff against stored knowledge.
    Incremental,
}

impl Directive {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Incremental => "incremental",
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns the string representation for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Breadth of a scope plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeBreadth {
    Full,
    Partial,
}

/// A collector left out of a run, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCollector {
    pub collector: String,
    pub reason: String,
}

/// What the scoping stage decided to investigate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopePlan {
    pub directive: Directive,
    pub scope: ScopeBreadth,
    /// Collectors selected for this run.
    pub collectors: Vec<String>,
    pub skipped: Vec<SkippedCollector>,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub days_since_last_run: Option<i64>,
}

/// One external fetch made during a run, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Collector node that made the call.
    pub collector: String,
    pub source_id: String,
    pub fetch_status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
}

impl ToolCall {
    /// Build a tool call record from a provenance envelope.
    #[must_use]
    pub fn from_envelope(collector: impl Into<String>, envelope: &ProvenanceEnvelope) -> Self {
        Self {
            collector: collector.into(),
            source_id: envelope.source_id.clone(),
            fetch_status: envelope.fetch_status,
            error: envelope.error.clone(),
            raw_url: envelope.raw_url.clone(),
        }
    }
}

/// Verification status of one source within a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheck {
    pub source_id: String,
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Verification status of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVerification {
    /// Worst status among the category's sources.
    pub status: FetchStatus,
    pub sources: Vec<SourceCheck>,
}

/// A fetch that did not verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub source_id: String,
    pub status: FetchStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub raw_url: Option<String>,
}

/// Fan-in verification summary recorded on the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total_tool_calls: usize,
    pub verified_count: usize,
    pub failed_count: usize,
    /// Claims downgraded because their source did not verify.
    pub flagged_claims: usize,
    pub categories: BTreeMap<String, CategoryVerification>,
    pub fetch_failures: Vec<FetchFailure>,
}

/// Whether the re-evaluation stage ran, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReevaluationOutcome {
    Completed { high_deltas: usize },
    Skipped { reason: String },
}

/// One execution of the pipeline for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub entity: String,
    /// Monotonic per entity, starting at 1.
    pub run_number: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub directive: Directive,
    pub status: RunStatus,
    #[serde(default)]
    pub scope: Option<ScopePlan>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub deltas: Vec<Delta>,
    #[serde(default)]
    pub verification_summary: Option<VerificationSummary>,
    #[serde(default)]
    pub reevaluation: Option<ReevaluationOutcome>,
    /// Reference to the knowledge record version written by this run.
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Run {
    /// Create a new running run.
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        run_number: u64,
        directive: Directive,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            entity: entity.into(),
            run_number,
            started_at,
            completed_at: None,
            directive,
            status: RunStatus::Running,
            scope: None,
            tool_calls: Vec::new(),
            deltas: Vec::new(),
            verification_summary: None,
            reevaluation: None,
            result_ref: None,
            summary: None,
            error: None,
        }
    }

    /// Number of HIGH significance deltas.
    #[must_use]
    pub fn high_delta_count(&self) -> usize {
        self.deltas
            .iter()
            .filter(|d| d.significance == Significance::High)
            .count()
    }

    /// Summary view used by run listings.
    #[must_use]
    pub fn summary_view(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            entity: self.entity.clone(),
            run_number: self.run_number,
            directive: self.directive,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            delta_count: self.deltas.len(),
            high_delta_count: self.high_delta_count(),
            error: self.error.clone(),
        }
    }
}

/// Compact run listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub entity: String,
    pub run_number: u64,
    pub directive: Directive,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub delta_count: usize,
    pub high_delta_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status of one monitored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity: String,
    pub has_record: bool,
    pub total_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Whether a run is currently active for the entity.
    #[serde(default)]
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{FieldValue, TrendDirection};

    #[test]
    fn test_directive_wire_names() {
        assert_eq!(
            serde_json::to_string(&Directive::ColdStart).unwrap(),
            "\"cold_start\""
        );
        assert_eq!(Directive::Incremental.as_str(), "incremental");
    }

    #[test]
    fn test_new_run_is_running() {
        let run = Run::new("Bedok", 1, Directive::ColdStart, Utc::now());
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());
        assert!(run.completed_at.is_none());
        assert_eq!(run.high_delta_count(), 0);
    }

    #[test]
    fn test_summary_view_counts_high_deltas() {
        let mut run = Run::new("Bedok", 3, Directive::Incremental, Utc::now());
        for significance in [Significance::High, Significance::Low, Significance::High] {
            run.deltas.push(Delta {
                category: "x".into(),
                old_value: None,
                new_value: FieldValue::Number(1.0),
                significance,
                trend_direction: TrendDirection::Stable,
                change: String::new(),
                source_ref: None,
            });
        }

        let summary = run.summary_view();
        assert_eq!(summary.run_number, 3);
        assert_eq!(summary.delta_count, 3);
        assert_eq!(summary.high_delta_count, 2);
    }

    #[test]
    fn test_reevaluation_outcome_tagging() {
        let skipped = ReevaluationOutcome::Skipped {
            reason: "No HIGH significance changes".into(),
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "No HIGH significance changes");
    }
}
