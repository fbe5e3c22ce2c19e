//! Knowledge integration: merge verified findings into the stored record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::MergeConfig;
use crate::knowledge::{
    CategoryEntry, ChangeLogEntry, Delta, FieldValue, GroundingSource, KnowledgeRecord, ListItem,
    PulseEntry,
};

use super::{Directive, NormalizedClaim};

/// Inputs of one integration step.
#[derive(Debug, Clone, Copy)]
pub struct IntegrationInput<'a> {
    pub run_id: Uuid,
    pub run_number: u64,
    pub directive: Directive,
    pub now: DateTime<Utc>,
    /// One verified, typed finding per category.
    pub findings: &'a BTreeMap<String, NormalizedClaim>,
    pub deltas: &'a [Delta],
    /// Categories observed this run without any verified value.
    pub unavailable: &'a BTreeSet<String>,
    pub pulse: &'a [PulseEntry],
    pub sources: &'a [GroundingSource],
}

/// Merges findings into a knowledge record under a [`MergeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeIntegrator<'a> {
    config: &'a MergeConfig,
}

impl<'a> KnowledgeIntegrator<'a> {
    #[must_use]
    pub fn new(config: &'a MergeConfig) -> Self {
        Self { config }
    }

    /// Produce the next version of an entity's record.
    ///
    /// Applying the same run twice yields the record of the first
    /// application.
    #[must_use]
    pub fn integrate(
        &self,
        entity: &str,
        prior: Option<&KnowledgeRecord>,
        input: &IntegrationInput<'_>,
    ) -> KnowledgeRecord {
        if let Some(prior) = prior {
            if prior.last_run_id == Some(input.run_id) {
                tracing::debug!(entity, run_id = %input.run_id, "Run already integrated");
                return prior.clone();
            }
        }

        let mut record = prior
            .cloned()
            .unwrap_or_else(|| KnowledgeRecord::new(entity, input.now));
        let alpha = match input.directive {
            Directive::ColdStart => self.config.alpha_cold_start,
            Directive::Incremental => self.config.alpha_incremental,
        };

        for (category, claim) in input.findings {
            let delta = input.deltas.iter().find(|d| &d.category == category);
            match record.categories.get_mut(category) {
                Some(entry) => self.update_entry(entry, claim, delta, alpha, input.now),
                None => {
                    record.categories.insert(
                        category.clone(),
                        CategoryEntry {
                            value: self.cap_value(claim.value.clone()),
                            confidence: clamp_unit(self.config.initial_confidence),
                            last_updated_at: input.now,
                            source_ref: Some(claim.source_id.clone()),
                            verified_streak: 1,
                        },
                    );
                }
            }
        }

        for category in input.unavailable {
            if input.findings.contains_key(category) {
                continue;
            }
            if let Some(entry) = record.categories.get_mut(category) {
                entry.confidence = self.decayed(entry.confidence);
                entry.verified_streak = 0;
            }
        }

        record.pulse = merge_keyed(
            input.pulse,
            &record.pulse,
            PulseEntry::identity,
            |p| p.timestamp,
            self.config.max_pulse_entries,
        );
        record.sources = merge_sources(input.sources, &record.sources, self.config.max_sources);

        record.change_log.extend(
            input
                .deltas
                .iter()
                .filter(|d| d.is_material())
                .map(|delta| ChangeLogEntry {
                    run_id: input.run_id,
                    run_number: input.run_number,
                    recorded_at: input.now,
                    delta: delta.clone(),
                }),
        );
        let excess = record
            .change_log
            .len()
            .saturating_sub(self.config.max_change_log);
        record.change_log.drain(..excess);

        record.total_runs += 1;
        record.last_run_at = input.now;
        record.last_run_id = Some(input.run_id);
        record
    }

    fn update_entry(
        &self,
        entry: &mut CategoryEntry,
        claim: &NormalizedClaim,
        delta: Option<&Delta>,
        alpha: f64,
        now: DateTime<Utc>,
    ) {
        let material = delta.is_some_and(Delta::is_material);
        let next = match (&entry.value, &claim.value) {
            (FieldValue::Number(old), FieldValue::Number(new)) => {
                Some(FieldValue::Number(alpha * new + (1.0 - alpha) * old))
            }
            (FieldValue::List(old), FieldValue::List(new)) => Some(FieldValue::List(merge_keyed(
                new,
                old,
                |item: &ListItem| item.key.clone(),
                |item| item.observed_at,
                self.config.max_list_items,
            ))),
            _ if material => Some(self.cap_value(claim.value.clone())),
            _ => None,
        };

        if let Some(value) = next {
            entry.value = value;
            entry.source_ref = Some(claim.source_id.clone());
        }
        entry.confidence = self.reinforced(entry.confidence);
        entry.verified_streak = entry.verified_streak.saturating_add(1);
        entry.last_updated_at = now;
    }

    fn cap_value(&self, value: FieldValue) -> FieldValue {
        match value {
            FieldValue::List(items) => FieldValue::List(merge_keyed(
                &items,
                &[],
                |item: &ListItem| item.key.clone(),
                |item| item.observed_at,
                self.config.max_list_items,
            )),
            other => other,
        }
    }

    fn reinforced(&self, confidence: f64) -> f64 {
        clamp_unit(confidence + self.config.confidence_gain * (1.0 - confidence))
    }

    fn decayed(&self, confidence: f64) -> f64 {
        let floor = self.config.confidence_floor;
        if confidence <= floor {
            return clamp_unit(confidence);
        }
        clamp_unit(confidence - self.config.confidence_decay * (confidence - floor))
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Union two keyed sequences, keeping the newest version of each key,
/// ordered newest first and truncated to `cap`.
pub fn merge_keyed<T, K, FK, FT>(
    incoming: &[T],
    existing: &[T],
    key: FK,
    observed_at: FT,
    cap: usize,
) -> Vec<T>
where
    T: Clone,
    K: Ord,
    FK: Fn(&T) -> K,
    FT: Fn(&T) -> DateTime<Utc>,
{
    let mut by_key: BTreeMap<K, T> = BTreeMap::new();
    for item in existing.iter().chain(incoming) {
        let k = key(item);
        match by_key.get(&k) {
            Some(current) if observed_at(current) > observed_at(item) => {}
            _ => {
                by_key.insert(k, item.clone());
            }
        }
    }
    let mut merged: Vec<T> = by_key.into_values().collect();
    merged.sort_by_key(|item| std::cmp::Reverse(observed_at(item)));
    merged.truncate(cap);
    merged
}

/// Incoming sources first, de-duplicated by URI, truncated to `cap`.
fn merge_sources(
    incoming: &[GroundingSource],
    existing: &[GroundingSource],
    cap: usize,
) -> Vec<GroundingSource> {
    let mut seen = BTreeSet::new();
    incoming
        .iter()
        .chain(existing)
        .filter(|s| !s.uri.is_empty() && seen.insert(s.uri.clone()))
        .take(cap)
        .cloned()
        .collect()
}
