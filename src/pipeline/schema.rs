//! Findings schema boundary.
//!
//! Raw claim values are typed into [`FieldValue`]s here, before delta
//! detection. A value that cannot be typed is rejected with
//! [`MalformedFindings`] and its category is treated as unavailable.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::config::SchemaConfig;
use crate::knowledge::{FieldValue, ListItem};

use super::VerifiedClaim;

/// A verified claim whose value passed the schema boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClaim {
    pub category: String,
    pub value: FieldValue,
    pub source_id: String,
    pub confidence: f64,
}

/// A claim value that could not be typed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed findings for {category}: {reason}")]
pub struct MalformedFindings {
    pub category: String,
    pub source_id: String,
    pub reason: String,
}

/// Placeholder strings collectors use when they found nothing.
const MISSING_MARKERS: &[&str] = &["unavailable", "n/a", "na", "unknown", "none", "null", "-"];

fn numeric_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?:[A-Z]{0,3}\$|[$€£])?\s*(-?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?)\s*%?$")
                .ok()
        })
        .as_ref()
}

/// Parse strings like `8,200`, `S$8,200.50` or `12.5%`.
fn parse_numeric(text: &str) -> Option<f64> {
    let captures = numeric_pattern()?.captures(text)?;
    captures.get(1)?.as_str().replace(',', "").parse().ok()
}

fn item_timestamp(item: &Value, default: DateTime<Utc>) -> DateTime<Utc> {
    ["observed_at", "timestamp", "date"]
        .iter()
        .filter_map(|field| item.get(*field).and_then(Value::as_str))
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or(default, |dt| dt.with_timezone(&Utc))
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Identity key of a list item, or `None` if it has none.
fn item_key(category: &str, item: &Value, config: &SchemaConfig) -> Option<String> {
    if let Some(object) = item.as_object() {
        if let Some(fields) = config.identity_fields.get(category) {
            let parts: Option<Vec<String>> = fields
                .iter()
                .map(|f| object.get(f).and_then(scalar_key))
                .collect();
            return parts.map(|p| p.join("|").to_lowercase());
        }
        return config
            .fallback_identity_fields
            .iter()
            .find_map(|f| object.get(f).and_then(scalar_key))
            .map(|k| k.to_lowercase());
    }
    scalar_key(item).map(|k| k.to_lowercase())
}

fn normalize_list(
    category: &str,
    items: &[Value],
    observed_at: DateTime<Utc>,
    config: &SchemaConfig,
) -> Result<FieldValue, String> {
    let mut keyed: BTreeMap<String, ListItem> = BTreeMap::new();
    let mut dropped = 0usize;

    for item in items {
        let Some(key) = item_key(category, item, config) else {
            dropped += 1;
            continue;
        };
        let candidate = ListItem::new(key.clone(), item_timestamp(item, observed_at), item.clone());
        match keyed.get(&key) {
            Some(existing) if existing.observed_at > candidate.observed_at => {}
            _ => {
                keyed.insert(key, candidate);
            }
        }
    }

    if keyed.is_empty() && !items.is_empty() {
        return Err(format!("none of {} list items has an identity key", items.len()));
    }
    if dropped > 0 {
        tracing::debug!(category, dropped, "Dropped list items without identity");
    }

    let mut list: Vec<ListItem> = keyed.into_values().collect();
    list.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    Ok(FieldValue::List(list))
}

fn to_field_value(
    category: &str,
    value: &Value,
    observed_at: DateTime<Utc>,
    config: &SchemaConfig,
) -> Result<FieldValue, String> {
    match value {
        Value::Null => Err("value is missing".to_string()),
        Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(FieldValue::Number)
            .ok_or_else(|| format!("number {n} is not representable")),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || MISSING_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
                return Err(format!("placeholder value {trimmed:?}"));
            }
            Ok(parse_numeric(trimmed).map_or_else(
                || FieldValue::Text(trimmed.to_string()),
                FieldValue::Number,
            ))
        }
        Value::Array(items) => normalize_list(category, items, observed_at, config),
        Value::Object(object) => match object.get("value") {
            Some(inner) => to_field_value(category, inner, observed_at, config),
            None => Err("object without a value field".to_string()),
        },
    }
}

/// Type one verified claim.
///
/// # Errors
///
/// Returns `MalformedFindings` if the value is missing, a placeholder, or
/// has a shape that cannot be typed.
pub fn normalize_claim(
    claim: &VerifiedClaim,
    observed_at: DateTime<Utc>,
    config: &SchemaConfig,
) -> Result<NormalizedClaim, MalformedFindings> {
    let category = &claim.claim.category;
    to_field_value(category, &claim.claim.value, observed_at, config)
        .map(|value| NormalizedClaim {
            category: category.clone(),
            value,
            source_id: claim.claim.source_id.clone(),
            confidence: claim.confidence,
        })
        .map_err(|reason| MalformedFindings {
            category: category.clone(),
            source_id: claim.claim.source_id.clone(),
            reason,
        })
}

/// Reduce normalized claims to one per category.
///
/// Lists from several sources are unioned by key; for scalar values the
/// most confident claim wins, later claims winning ties.
#[must_use]
pub fn consolidate(claims: Vec<NormalizedClaim>) -> BTreeMap<String, NormalizedClaim> {
    let mut merged: BTreeMap<String, NormalizedClaim> = BTreeMap::new();
    for claim in claims {
        match merged.get_mut(&claim.category) {
            None => {
                merged.insert(claim.category.clone(), claim);
            }
            Some(current) => {
                let both_lists = matches!(
                    (&current.value, &claim.value),
                    (FieldValue::List(_), FieldValue::List(_))
                );
                if both_lists {
                    union_lists(current, claim);
                } else if claim.confidence >= current.confidence {
                    *current = claim;
                }
            }
        }
    }
    merged
}

fn union_lists(current: &mut NormalizedClaim, claim: NormalizedClaim) {
    let confidence = claim.confidence;
    if let (FieldValue::List(existing), FieldValue::List(incoming)) =
        (&mut current.value, claim.value)
    {
        for item in incoming {
            match existing.iter_mut().find(|i| i.key == item.key) {
                Some(slot) if slot.observed_at <= item.observed_at => *slot = item,
                Some(_) => {}
                None => existing.push(item),
            }
        }
        existing.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    }
    current.confidence = current.confidence.max(confidence);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Claim;
    use serde_json::json;

    fn verified(category: &str, value: Value) -> VerifiedClaim {
        VerifiedClaim {
            claim: Claim::new(category, value, "src"),
            collector: "agent".into(),
            confidence: 1.0,
        }
    }

    fn normalize(category: &str, value: Value) -> Result<FieldValue, MalformedFindings> {
        normalize_claim(&verified(category, value), Utc::now(), &SchemaConfig::default())
            .map(|c| c.value)
    }

    #[test]
    fn test_numeric_strings_become_numbers() {
        assert_eq!(parse_numeric("8,200"), Some(8200.0));
        assert_eq!(parse_numeric("S$8,200.50"), Some(8200.5));
        assert_eq!(parse_numeric("12.5%"), Some(12.5));
        assert_eq!(parse_numeric("-3"), Some(-3.0));
        assert_eq!(parse_numeric("Upper middle"), None);
        assert_eq!(parse_numeric("Block 12"), None);

        assert_eq!(
            normalize("medianIncome", json!("S$8,200")).unwrap(),
            FieldValue::Number(8200.0)
        );
    }

    #[test]
    fn test_text_and_nested_values() {
        assert_eq!(
            normalize("incomeBand", json!("  Upper middle ")).unwrap(),
            FieldValue::Text("Upper middle".into())
        );
        assert_eq!(
            normalize("medianIncome", json!({"value": 8000, "unit": "SGD"})).unwrap(),
            FieldValue::Number(8000.0)
        );
    }

    #[test]
    fn test_missing_values_are_malformed() {
        for value in [json!(null), json!(""), json!("UNAVAILABLE"), json!({"unit": "SGD"})] {
            let err = normalize("medianIncome", value).unwrap_err();
            assert_eq!(err.category, "medianIncome");
        }
    }

    #[test]
    fn test_list_items_keyed_by_identity_fields() {
        let value = normalize(
            "activeTenders",
            json!([
                {"block": "123", "street": "Bedok North", "closing": "2026-02-01"},
                {"block": "123", "street": "BEDOK NORTH", "closing": "2026-02-08"},
                {"block": "45", "street": "Bedok South"},
                {"street": "no block"}
            ]),
        )
        .unwrap();

        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert!(keys.contains(&"123|bedok north"));
        assert!(keys.contains(&"45|bedok south"));
    }

    #[test]
    fn test_list_without_any_identity_is_malformed() {
        let err = normalize("activeTenders", json!([{"street": "x"}, {"street": "y"}])).unwrap_err();
        assert!(err.reason.contains("identity"));
        assert_eq!(normalize("activeTenders", json!([])).unwrap(), FieldValue::List(vec![]));
    }

    #[test]
    fn test_fallback_identity_and_item_timestamps() {
        let value = normalize(
            "marketNews",
            json!([
                {"title": "Mall opens", "timestamp": "2026-01-02T00:00:00Z"},
                {"title": "Clinic closes", "timestamp": "2026-03-01T00:00:00Z"}
            ]),
        )
        .unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items[0].key, "clinic closes");
        assert_eq!(items[1].key, "mall opens");
    }

    #[test]
    fn test_consolidate_prefers_confident_scalars_and_unions_lists() {
        let now = Utc::now();
        let scalar = |value: f64, confidence: f64| NormalizedClaim {
            category: "medianIncome".into(),
            value: FieldValue::Number(value),
            source_id: format!("s{value}"),
            confidence,
        };
        let list = |keys: &[&str]| NormalizedClaim {
            category: "activeTenders".into(),
            value: FieldValue::List(
                keys.iter()
                    .map(|k| ListItem::new(*k, now, json!({})))
                    .collect(),
            ),
            source_id: "hdb".into(),
            confidence: 1.0,
        };

        let merged = consolidate(vec![
            scalar(8000.0, 0.9),
            scalar(8100.0, 0.5),
            list(&["a", "b"]),
            list(&["b", "c"]),
        ]);

        assert_eq!(merged["medianIncome"].value, FieldValue::Number(8000.0));
        assert_eq!(merged["activeTenders"].value.as_list().unwrap().len(), 3);
    }
}
