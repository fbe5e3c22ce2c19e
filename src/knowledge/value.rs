//! Typed category values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in a list-typed category (tenders, timeline entries, ...).
///
/// Lists are merged by `key`, so two items with the same key describe the
/// same real-world thing observed at different times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    /// Stable identity key used for de-duplication.
    pub key: String,
    /// When this version of the item was observed.
    pub observed_at: DateTime<Utc>,
    /// Item payload as reported by the collector.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ListItem {
    /// Create a new list item.
    #[must_use]
    pub fn new(key: impl Into<String>, observed_at: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            observed_at,
            data,
        }
    }
}

/// Value stored for one category of a knowledge record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Numeric measurement (income, population, rent psf, ...).
    Number(f64),
    /// Free text or categorical label.
    Text(String),
    /// Keyed list of items.
    List(Vec<ListItem>),
}

impl FieldValue {
    /// Short name of the value kind, used in logs and change descriptions.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::List(_) => "list",
        }
    }

    /// Numeric value, if this is a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// List items, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[ListItem]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Compact human-readable rendering.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Number(n) => format!("{n}"),
            Self::Text(s) => s.clone(),
            Self::List(items) => format!("{} items", items.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_wire_format() {
        let value = FieldValue::Number(8000.0);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "number", "value": 8000.0}));

        let text = FieldValue::Text("Upper Mid".to_string());
        let json = serde_json::to_string(&text).unwrap();
        assert!(json.contains("\"kind\":\"text\""));
    }

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::Number(1.5).as_number(), Some(1.5));
        assert!(FieldValue::Number(1.5).as_text().is_none());
        assert_eq!(FieldValue::Text("a".into()).as_text(), Some("a"));

        let list = FieldValue::List(vec![ListItem::new(
            "blk-1",
            Utc::now(),
            serde_json::json!({"block": "1"}),
        )]);
        assert_eq!(list.as_list().map(<[ListItem]>::len), Some(1));
        assert_eq!(list.kind(), "list");
        assert_eq!(list.display(), "1 items");
    }
}
