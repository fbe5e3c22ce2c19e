//! The per-entity knowledge record.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Delta, FieldValue};

/// Stored knowledge for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEntry {
    /// Last accepted value. Never absent once a category exists.
    pub value: FieldValue,
    /// Confidence in `value`, always within `[0, 1]`.
    pub confidence: f64,
    /// When `value` was last changed by a verified observation.
    pub last_updated_at: DateTime<Utc>,
    /// Source the current value was attributed to.
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Number of consecutive verified observations.
    #[serde(default)]
    pub verified_streak: u32,
}

/// Impact of a pulse timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Positive,
    Negative,
    #[default]
    Neutral,
}

/// A notable event in the entity's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub impact: Impact,
    /// Source this entry was reported by.
    #[serde(default)]
    pub source_id: Option<String>,
}

impl PulseEntry {
    /// Identity used for de-duplication.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}|{}", self.timestamp.to_rfc3339(), self.event.trim())
    }
}

/// A source that grounds the record's claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

/// A material delta folded into the record's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub run_id: Uuid,
    pub run_number: u64,
    pub recorded_at: DateTime<Utc>,
    pub delta: Delta,
}

/// Output of the re-evaluation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Run that produced this evaluation.
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// Short narrative of the entity's outlook.
    pub summary: String,
    /// Structured recommendations, opaque to the engine.
    #[serde(default)]
    pub recommendations: Vec<serde_json::Value>,
}

/// The evolving knowledge base for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub entity: String,
    pub monitoring_started: DateTime<Utc>,
    pub last_run_at: DateTime<Utc>,
    /// Last run merged into this record; guards against double application.
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
    pub total_runs: u64,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryEntry>,
    /// Newest-first, bounded.
    #[serde(default)]
    pub pulse: Vec<PulseEntry>,
    /// Bounded, de-duplicated by URI.
    #[serde(default)]
    pub sources: Vec<GroundingSource>,
    /// Oldest-first, bounded.
    #[serde(default)]
    pub change_log: Vec<ChangeLogEntry>,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
}

impl KnowledgeRecord {
    /// Create an empty record for an entity.
    #[must_use]
    pub fn new(entity: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            entity: entity.into(),
            monitoring_started: now,
            last_run_at: now,
            last_run_id: None,
            total_runs: 0,
            categories: BTreeMap::new(),
            pulse: Vec::new(),
            sources: Vec::new(),
            change_log: Vec::new(),
            evaluation: None,
        }
    }

    /// Look up a category.
    #[must_use]
    pub fn category(&self, name: &str) -> Option<&CategoryEntry> {
        self.categories.get(name)
    }

    /// Whether every category is older than `threshold`.
    ///
    /// A record without categories is considered stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.categories
            .values()
            .all(|entry| now - entry.last_updated_at > threshold)
    }

    /// Time since the most recently updated category, if any.
    #[must_use]
    pub fn freshest_update(&self) -> Option<DateTime<Utc>> {
        self.categories.values().map(|e| e.last_updated_at).max()
    }

    /// Client-facing projection used by `GetLatestResult`.
    #[must_use]
    pub fn projection(&self) -> AnalysisView {
        AnalysisView {
            entity: self.entity.clone(),
            monitoring_started: self.monitoring_started,
            last_scanned_at: self.last_run_at,
            total_runs: self.total_runs,
            values: self
                .categories
                .iter()
                .map(|(name, entry)| (name.clone(), entry.value.clone()))
                .collect(),
            pulse: self.pulse.clone(),
            sources: self.sources.clone(),
            evaluation: self.evaluation.clone(),
        }
    }
}

/// Latest-result projection of a knowledge record, without confidence data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisView {
    pub entity: String,
    pub monitoring_started: DateTime<Utc>,
    pub last_scanned_at: DateTime<Utc>,
    pub total_runs: u64,
    pub values: BTreeMap<String, FieldValue>,
    pub pulse: Vec<PulseEntry>,
    pub sources: Vec<GroundingSource>,
    pub evaluation: Option<Evaluation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: f64, updated: DateTime<Utc>) -> CategoryEntry {
        CategoryEntry {
            value: FieldValue::Number(value),
            confidence: 0.6,
            last_updated_at: updated,
            source_ref: None,
            verified_streak: 1,
        }
    }

    #[test]
    fn test_empty_record_is_stale() {
        let now = Utc::now();
        let record = KnowledgeRecord::new("Bedok", now);
        assert!(record.is_stale(now, Duration::hours(1)));
        assert!(record.freshest_update().is_none());
    }

    #[test]
    fn test_staleness_requires_all_categories_old() {
        let now = Utc::now();
        let mut record = KnowledgeRecord::new("Bedok", now);
        record
            .categories
            .insert("a".into(), entry(1.0, now - Duration::days(40)));
        assert!(record.is_stale(now, Duration::days(30)));

        record
            .categories
            .insert("b".into(), entry(2.0, now - Duration::days(1)));
        assert!(!record.is_stale(now, Duration::days(30)));
        assert_eq!(record.freshest_update(), Some(now - Duration::days(1)));
    }

    #[test]
    fn test_projection_drops_confidence() {
        let now = Utc::now();
        let mut record = KnowledgeRecord::new("Bedok", now);
        record.categories.insert("medianIncome".into(), entry(8000.0, now));

        let view = record.projection();
        assert_eq!(view.entity, "Bedok");
        assert_eq!(view.values["medianIncome"], FieldValue::Number(8000.0));

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("confidence"));
    }

    #[test]
    fn test_pulse_identity_ignores_whitespace() {
        let ts = Utc::now();
        let a = PulseEntry {
            timestamp: ts,
            event: "New MRT line".into(),
            impact: Impact::Positive,
            source_id: None,
        };
        let b = PulseEntry {
            event: " New MRT line ".into(),
            ..a.clone()
        };
        assert_eq!(a.identity(), b.identity());
    }
}
