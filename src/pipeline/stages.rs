//! Pluggable generative stages: re-evaluation and ad-hoc dossiers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::knowledge::{AnalysisView, Delta, KnowledgeRecord};

/// Errors from a generative stage.
#[derive(thiserror::Error, Debug)]
pub enum GenerationError {
    /// No generator is configured.
    #[error("Generator unavailable: {0}")]
    Unavailable(String),

    #[error("Generation request failed: {0}")]
    Request(String),

    /// The generator answered with something that is not the expected shape.
    #[error("Invalid generator response: {0}")]
    InvalidResponse(String),
}

/// Output of a re-evaluation before it is stamped with its run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDraft {
    pub summary: String,
    #[serde(default)]
    pub recommendations: Vec<serde_json::Value>,
}

/// The expensive downstream stage, run only when a HIGH delta is present.
#[async_trait]
pub trait Reevaluator: Send + Sync {
    /// Re-evaluate an entity given its freshly merged record and the HIGH deltas.
    async fn reevaluate(
        &self,
        record: &KnowledgeRecord,
        high: &[Delta],
    ) -> Result<EvaluationDraft, GenerationError>;
}

/// Generator of one-off dossiers outside the run machinery.
#[async_trait]
pub trait DossierGenerator: Send + Sync {
    async fn generate(&self, view: &AnalysisView, topic: &str) -> Result<Dossier, GenerationError>;
}

/// Business profile section of a dossier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessProfile {
    pub size: String,
    pub target_audience: String,
    pub strategy: String,
    pub employees: String,
}

impl Default for BusinessProfile {
    fn default() -> Self {
        let tbd = || "TBD".to_string();
        Self {
            size: tbd(),
            target_audience: tbd(),
            strategy: tbd(),
            employees: tbd(),
        }
    }
}

/// Financial estimates of a dossier, in local currency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Financials {
    pub upfront_cost: f64,
    pub monthly_cost: f64,
    pub monthly_revenue_bad: f64,
    pub monthly_revenue_avg: f64,
    pub monthly_revenue_good: f64,
}

/// A single findings record produced for a custom topic.
///
/// Missing non-essential fields take defaults when parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dossier {
    pub business_type: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_score")]
    pub opportunity_score: f64,
    #[serde(default)]
    pub thesis: String,
    #[serde(default)]
    pub gap_reason: String,
    #[serde(default)]
    pub estimated_rental: f64,
    #[serde(default)]
    pub suggested_locations: Vec<String>,
    #[serde(default)]
    pub business_profile: BusinessProfile,
    #[serde(default)]
    pub financials: Financials,
    #[serde(default)]
    pub data_source_url: String,
}

fn default_category() -> String {
    "Other".to_string()
}

fn default_score() -> f64 {
    50.0
}

impl Dossier {
    /// Clamp the score into `[0, 100]` and fill the location if none was given.
    #[must_use]
    pub fn normalized(mut self, entity: &str) -> Self {
        self.opportunity_score = if self.opportunity_score.is_finite() {
            self.opportunity_score.clamp(0.0, 100.0)
        } else {
            default_score()
        };
        if self.suggested_locations.is_empty() {
            self.suggested_locations.push(entity.to_string());
        }
        self
    }
}

/// Deterministic re-evaluator used when no model is configured.
///
/// Summarizes the HIGH deltas and carries prior recommendations forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestReevaluator;

#[async_trait]
impl Reevaluator for DigestReevaluator {
    async fn reevaluate(
        &self,
        record: &KnowledgeRecord,
        high: &[Delta],
    ) -> Result<EvaluationDraft, GenerationError> {
        let changes: Vec<&str> = high.iter().map(|d| d.change.as_str()).collect();
        Ok(EvaluationDraft {
            summary: format!(
                "{} significant change(s) for {}: {}",
                high.len(),
                record.entity,
                changes.join("; ")
            ),
            recommendations: record
                .evaluation
                .as_ref()
                .map(|e| e.recommendations.clone())
                .unwrap_or_default(),
        })
    }
}

/// Dossier generator that always fails; used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl DossierGenerator for UnconfiguredGenerator {
    async fn generate(&self, _view: &AnalysisView, _topic: &str) -> Result<Dossier, GenerationError> {
        Err(GenerationError::Unavailable(
            "no generative model configured".to_string(),
        ))
    }
}
