//! Source verification: the fan-in point after the collector pool.
//!
//! A claim is only trusted if the envelope of its source is VERIFIED. Claims
//! without a matching envelope are treated as UNAVAILABLE.

use std::collections::{BTreeMap, BTreeSet};

use crate::collector::{Claim, CollectorOutcome, FetchStatus, ProvenanceEnvelope};
use crate::config::VerifierConfig;
use crate::knowledge::{GroundingSource, PulseEntry};

use super::{CategoryVerification, FetchFailure, SourceCheck, VerificationSummary};

/// Pseudo-category used to flag pulse entries from unverified sources.
pub const PULSE_CATEGORY: &str = "pulse";

const MISSING_ENVELOPE: &str = "no provenance envelope";

/// A claim whose source verified.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaim {
    pub claim: Claim,
    pub collector: String,
    pub confidence: f64,
}

/// A claim downgraded because its source did not verify.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedClaim {
    pub claim: Claim,
    pub collector: String,
    pub fetch_status: FetchStatus,
    pub error: Option<String>,
    /// Effective confidence, pinned to the configured floor.
    pub confidence: f64,
}

/// Everything downstream stages need from verification.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub accepted: Vec<VerifiedClaim>,
    pub flagged: Vec<FlaggedClaim>,
    /// Categories observed this run with no verified claim.
    pub unavailable_categories: BTreeSet<String>,
    pub pulse: Vec<PulseEntry>,
    pub sources: Vec<GroundingSource>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone)]
struct SourceState {
    status: FetchStatus,
    error: Option<String>,
}

/// Worst status seen for each source id across all collectors.
fn source_states(outcomes: &[CollectorOutcome]) -> BTreeMap<String, SourceState> {
    let mut states: BTreeMap<String, SourceState> = BTreeMap::new();
    for envelope in outcomes.iter().flat_map(|o| &o.output.provenance) {
        let state = states
            .entry(envelope.source_id.clone())
            .or_insert_with(|| SourceState {
                status: envelope.fetch_status,
                error: envelope.error.clone(),
            });
        if envelope.fetch_status > state.status {
            state.status = envelope.fetch_status;
            state.error.clone_from(&envelope.error);
        }
    }
    states
}

fn lookup(states: &BTreeMap<String, SourceState>, source_id: &str) -> SourceState {
    states.get(source_id).cloned().unwrap_or(SourceState {
        status: FetchStatus::Unavailable,
        error: Some(MISSING_ENVELOPE.to_string()),
    })
}

fn record_check(
    categories: &mut BTreeMap<String, CategoryVerification>,
    category: &str,
    check: SourceCheck,
) {
    let entry = categories
        .entry(category.to_string())
        .or_insert_with(|| CategoryVerification {
            status: FetchStatus::Verified,
            sources: Vec::new(),
        });
    entry.status = entry.status.max(check.status);
    if !entry.sources.iter().any(|s| s.source_id == check.source_id) {
        entry.sources.push(check);
    }
}

fn summarize_fetches(outcomes: &[CollectorOutcome], summary: &mut VerificationSummary) {
    for envelope in outcomes.iter().flat_map(|o| &o.output.provenance) {
        summary.total_tool_calls += 1;
        if envelope.fetch_status.is_verified() {
            summary.verified_count += 1;
        } else {
            summary.failed_count += 1;
            summary.fetch_failures.push(failure(envelope));
        }
    }
}

fn failure(envelope: &ProvenanceEnvelope) -> FetchFailure {
    FetchFailure {
        source_id: envelope.source_id.clone(),
        status: envelope.fetch_status,
        error: envelope.error.clone(),
        raw_url: envelope.raw_url.clone(),
    }
}

/// Cross-check every claim against provenance.
#[must_use]
pub fn verify(outcomes: &[CollectorOutcome], config: &VerifierConfig) -> VerificationReport {
    let states = source_states(outcomes);
    let mut report = VerificationReport::default();
    summarize_fetches(outcomes, &mut report.summary);

    for outcome in outcomes {
        if !outcome.is_success() {
            // The collector produced nothing; all of its categories went dark.
            let envelope = outcome.output.provenance.first();
            for category in &outcome.categories {
                record_check(
                    &mut report.summary.categories,
                    category,
                    SourceCheck {
                        source_id: envelope
                            .map_or_else(|| outcome.collector.clone(), |e| e.source_id.clone()),
                        status: FetchStatus::Unavailable,
                        error: outcome.error.clone(),
                    },
                );
            }
            continue;
        }

        for claim in &outcome.output.claims {
            let state = lookup(&states, &claim.source_id);
            record_check(
                &mut report.summary.categories,
                &claim.category,
                SourceCheck {
                    source_id: claim.source_id.clone(),
                    status: state.status,
                    error: state.error.clone(),
                },
            );

            if state.status.is_verified() {
                report.accepted.push(VerifiedClaim {
                    claim: claim.clone(),
                    collector: outcome.collector.clone(),
                    confidence: claim.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                });
            } else {
                report.flagged.push(FlaggedClaim {
                    claim: claim.clone(),
                    collector: outcome.collector.clone(),
                    fetch_status: state.status,
                    error: state.error,
                    confidence: config.low_confidence_floor,
                });
            }
        }

        let collector_verified = outcome
            .output
            .provenance
            .iter()
            .any(|e| e.fetch_status.is_verified());

        for entry in &outcome.output.pulse {
            let state = match &entry.source_id {
                Some(source_id) => lookup(&states, source_id),
                None if collector_verified => SourceState {
                    status: FetchStatus::Verified,
                    error: None,
                },
                None => lookup(&states, &outcome.collector),
            };
            if state.status.is_verified() {
                report.pulse.push(entry.clone());
            } else {
                report.flagged.push(FlaggedClaim {
                    claim: Claim::new(
                        PULSE_CATEGORY,
                        serde_json::to_value(entry).unwrap_or_default(),
                        entry
                            .source_id
                            .clone()
                            .unwrap_or_else(|| outcome.collector.clone()),
                    ),
                    collector: outcome.collector.clone(),
                    fetch_status: state.status,
                    error: state.error,
                    confidence: config.low_confidence_floor,
                });
            }
        }

        if collector_verified {
            report.sources.extend(outcome.output.sources.iter().cloned());
        }
    }

    let verified_categories: BTreeSet<&str> = report
        .accepted
        .iter()
        .map(|c| c.claim.category.as_str())
        .collect();
    report.unavailable_categories = report
        .summary
        .categories
        .keys()
        .filter(|c| !verified_categories.contains(c.as_str()))
        .cloned()
        .collect();
    report.summary.flagged_claims = report.flagged.len();

    tracing::debug!(
        accepted = report.accepted.len(),
        flagged = report.flagged.len(),
        verified = report.summary.verified_count,
        failed = report.summary.failed_count,
        "Verification complete"
    );

    report
}
