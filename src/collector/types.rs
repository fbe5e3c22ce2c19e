//! Collector inputs and outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knowledge::{GroundingSource, PulseEntry};
use crate::pipeline::Directive;

/// Outcome of a single external fetch.
///
/// Ordered from best to worst so the worst status of a group is its `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchStatus {
    Verified,
    Stale,
    Unavailable,
}

impl FetchStatus {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::Stale => "STALE",
            Self::Unavailable => "UNAVAILABLE",
        }
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Provenance of one source consulted by a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEnvelope {
    pub source_id: String,
    pub fetch_status: FetchStatus,
    /// Short error code such as `timeout_15s` or `http_503`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ProvenanceEnvelope {
    /// Envelope for a successful fetch.
    #[must_use]
    pub fn verified(source_id: impl Into<String>, raw_url: Option<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fetch_status: FetchStatus::Verified,
            error: None,
            raw_url,
            fetched_at: Some(Utc::now()),
        }
    }

    /// Envelope for a failed fetch.
    #[must_use]
    pub fn unavailable(source_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fetch_status: FetchStatus::Unavailable,
            error: Some(error.into()),
            raw_url: None,
            fetched_at: Some(Utc::now()),
        }
    }

    /// Attach the URL that was requested.
    #[must_use]
    pub fn with_url(mut self, raw_url: impl Into<String>) -> Self {
        self.raw_url = Some(raw_url.into());
        self
    }
}

/// A raw, unverified value reported for one category.
///
/// `value` is validated and typed later at the delta detector boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub category: String,
    pub value: serde_json::Value,
    /// Source whose provenance envelope vouches for this claim.
    pub source_id: String,
    /// Collector's own confidence in the claim, if it reports one.
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl Claim {
    #[must_use]
    pub fn new(
        category: impl Into<String>,
        value: serde_json::Value,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            value,
            source_id: source_id.into(),
            confidence: None,
        }
    }
}

/// Everything one collector produced for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorOutput {
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub provenance: Vec<ProvenanceEnvelope>,
    #[serde(default)]
    pub pulse: Vec<PulseEntry>,
    #[serde(default)]
    pub sources: Vec<GroundingSource>,
}

impl CollectorOutput {
    /// Output carrying a single failed envelope and nothing else.
    #[must_use]
    pub fn unavailable(envelope: ProvenanceEnvelope) -> Self {
        Self {
            provenance: vec![envelope],
            ..Self::default()
        }
    }
}

/// Context handed to every collector of a run.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub entity: String,
    pub directive: Directive,
}
