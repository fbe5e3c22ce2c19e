//! Delta detection: classify what changed between findings and knowledge.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{Polarity, PolicyConfig};
use crate::knowledge::{
    Delta, FieldValue, KnowledgeRecord, ListItem, Significance, TrendDirection,
};

use super::{Directive, NormalizedClaim};

/// Classifies per-category changes under a [`PolicyConfig`].
///
/// Pure: the same prior record, findings and directive always yield the
/// same deltas.
#[derive(Debug, Clone, Copy)]
pub struct DeltaDetector<'a> {
    policy: &'a PolicyConfig,
}

impl<'a> DeltaDetector<'a> {
    #[must_use]
    pub fn new(policy: &'a PolicyConfig) -> Self {
        Self { policy }
    }

    /// Map a relative change onto the significance scale.
    #[must_use]
    pub fn classify_ratio(&self, ratio: f64) -> Significance {
        if ratio >= self.policy.high_threshold {
            Significance::High
        } else if ratio >= self.policy.medium_threshold {
            Significance::Medium
        } else if ratio >= self.policy.low_threshold {
            Significance::Low
        } else {
            Significance::Noise
        }
    }

    /// Direction of a change with the given sign (`> 0` means the value grew).
    fn trend(&self, category: &str, significance: Significance, sign: f64) -> TrendDirection {
        if significance == Significance::Noise || sign == 0.0 {
            return TrendDirection::Stable;
        }
        let grew = sign > 0.0;
        match self.policy.directional.get(category) {
            Some(Polarity::HigherIsBetter) => improving_if(grew),
            Some(Polarity::LowerIsBetter) => improving_if(!grew),
            None if significance == Significance::High => improving_if(grew),
            None => TrendDirection::Stable,
        }
    }

    /// Deltas for every finding, in category order.
    #[must_use]
    pub fn detect(
        &self,
        prior: Option<&KnowledgeRecord>,
        findings: &BTreeMap<String, NormalizedClaim>,
        directive: Directive,
    ) -> Vec<Delta> {
        findings
            .values()
            .map(|claim| {
                let old = prior.and_then(|r| r.category(&claim.category)).map(|e| &e.value);
                Delta {
                    source_ref: Some(claim.source_id.clone()),
                    ..self.compare(&claim.category, old, &claim.value, directive)
                }
            })
            .collect()
    }

    /// Compare one category. Unchanged values yield a NOISE delta.
    fn compare(
        &self,
        category: &str,
        old: Option<&FieldValue>,
        new: &FieldValue,
        directive: Directive,
    ) -> Delta {
        let Some(old) = old else {
            let significance = match directive {
                Directive::ColdStart => self.policy.cold_start,
                Directive::Incremental => self.policy.new_category,
            }
            .max(Significance::Medium);
            return Delta {
                category: category.to_string(),
                old_value: None,
                new_value: new.clone(),
                significance,
                trend_direction: TrendDirection::New,
                change: format!("{category}: first observation ({})", new.display()),
                source_ref: None,
            };
        };

        let (significance, trend, change) = match (old, new) {
            (FieldValue::Number(a), FieldValue::Number(b)) => self.compare_numbers(category, *a, *b),
            (FieldValue::Text(a), FieldValue::Text(b)) => self.compare_text(category, a, b),
            (FieldValue::List(a), FieldValue::List(b)) => self.compare_lists(category, a, b),
            _ => (
                self.policy.categorical_change,
                TrendDirection::Stable,
                format!("{category}: type changed from {} to {}", old.kind(), new.kind()),
            ),
        };

        let significance = match directive {
            Directive::ColdStart => significance.max(self.policy.cold_start),
            Directive::Incremental => significance,
        };

        Delta {
            category: category.to_string(),
            old_value: Some(old.clone()),
            new_value: new.clone(),
            significance,
            trend_direction: trend,
            change,
            source_ref: None,
        }
    }

    fn compare_numbers(
        &self,
        category: &str,
        old: f64,
        new: f64,
    ) -> (Significance, TrendDirection, String) {
        let diff = new - old;
        let ratio = if old == 0.0 {
            if diff == 0.0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (diff / old).abs()
        };
        let significance = self.classify_ratio(ratio);
        let trend = self.trend(category, significance, diff);
        let change = if ratio.is_finite() {
            format!(
                "{category}: {} -> {} ({:+.1}%)",
                FieldValue::Number(old).display(),
                FieldValue::Number(new).display(),
                if old == 0.0 { 0.0 } else { diff / old.abs() * 100.0 }
            )
        } else {
            format!("{category}: {old} -> {new}")
        };
        (significance, trend, change)
    }

    fn compare_text(
        &self,
        category: &str,
        old: &str,
        new: &str,
    ) -> (Significance, TrendDirection, String) {
        if normalize_text(old) == normalize_text(new) {
            return (
                Significance::Noise,
                TrendDirection::Stable,
                format!("{category}: unchanged"),
            );
        }
        (
            self.policy.categorical_change,
            TrendDirection::Stable,
            format!("{category}: {old:?} -> {new:?}"),
        )
    }

    fn compare_lists(
        &self,
        category: &str,
        old: &[ListItem],
        new: &[ListItem],
    ) -> (Significance, TrendDirection, String) {
        let known: BTreeMap<&str, &ListItem> = old.iter().map(|i| (i.key.as_str(), i)).collect();
        let added: BTreeSet<&str> = new
            .iter()
            .map(|i| i.key.as_str())
            .filter(|k| !known.contains_key(k))
            .collect();
        let updated = new
            .iter()
            .filter(|i| known.get(i.key.as_str()).is_some_and(|o| o.data != i.data))
            .count();

        let changed = added.len() + updated;
        if changed == 0 {
            return (
                Significance::Noise,
                TrendDirection::Stable,
                format!("{category}: no new items"),
            );
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = changed as f64 / old.len().max(1) as f64;
        let significance = self.classify_ratio(ratio).max(Significance::Low);
        #[allow(clippy::cast_precision_loss)]
        let trend = self.trend(category, significance, added.len() as f64);
        (
            significance,
            trend,
            format!("{category}: {} new, {updated} updated", added.len()),
        )
    }
}

fn improving_if(condition: bool) -> TrendDirection {
    if condition {
        TrendDirection::Improving
    } else {
        TrendDirection::Declining
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
