//! Run scoping: cold start vs incremental, and which collectors are due.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::collector::Collector;
use crate::config::ScopeConfig;
use crate::knowledge::KnowledgeRecord;

use super::{Directive, ScopeBreadth, ScopePlan, SkippedCollector};

/// Decide the directive for a run.
///
/// No record, or a record whose categories are all older than the
/// staleness threshold, means a cold start.
#[must_use]
pub fn directive_for(
    record: Option<&KnowledgeRecord>,
    now: DateTime<Utc>,
    config: &ScopeConfig,
) -> Directive {
    match record {
        Some(record) if !record.is_stale(now, config.stale_after()) => Directive::Incremental,
        _ => Directive::ColdStart,
    }
}

fn describe(duration: Duration) -> String {
    if duration.num_days() >= 1 {
        format!("{}d", duration.num_days())
    } else {
        format!("{}h", duration.num_hours())
    }
}

/// Why a collector is due on an incremental run, or `None` if it is fresh.
fn due_reason(
    collector: &dyn Collector,
    record: &KnowledgeRecord,
    now: DateTime<Utc>,
) -> Option<String> {
    let interval = collector.refresh_interval();
    if interval <= Duration::zero() || collector.categories().is_empty() {
        return Some("checked every run".to_string());
    }

    let mut oldest: Option<(&str, Duration)> = None;
    for category in collector.categories() {
        let Some(entry) = record.category(category) else {
            return Some(format!("{category} not yet known"));
        };
        let age = now - entry.last_updated_at;
        if oldest.map_or(true, |(_, a)| age > a) {
            oldest = Some((category, age));
        }
    }

    match oldest {
        Some((category, age)) if age >= interval => Some(format!(
            "{category} is {} old (refresh every {})",
            describe(age),
            describe(interval)
        )),
        _ => None,
    }
}

/// Plan which collectors run.
///
/// Cold starts run every collector. Incremental runs pick collectors whose
/// categories are missing or older than the collector's refresh interval.
#[must_use]
pub fn plan(
    record: Option<&KnowledgeRecord>,
    collectors: &[Arc<dyn Collector>],
    directive: Directive,
    now: DateTime<Utc>,
) -> ScopePlan {
    let days_since_last_run = record.map(|r| (now - r.last_run_at).num_days());
    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    let mut reasons = Vec::new();

    match (directive, record) {
        (Directive::Incremental, Some(record)) => {
            for collector in collectors {
                match due_reason(collector.as_ref(), record, now) {
                    Some(reason) => {
                        reasons.push(format!("{}: {reason}", collector.name()));
                        selected.push(collector.name().to_string());
                    }
                    None => skipped.push(SkippedCollector {
                        collector: collector.name().to_string(),
                        reason: "Data is fresh".to_string(),
                    }),
                }
            }
        }
        _ => {
            reasons.push(match record {
                Some(_) => "Knowledge is stale, rebuilding from scratch".to_string(),
                None => "No knowledge base exists, full investigation".to_string(),
            });
            selected.extend(collectors.iter().map(|c| c.name().to_string()));
        }
    }

    let scope = if skipped.is_empty() {
        ScopeBreadth::Full
    } else {
        ScopeBreadth::Partial
    };

    ScopePlan {
        directive,
        scope,
        collectors: selected,
        skipped,
        reasons,
        days_since_last_run,
    }
}
