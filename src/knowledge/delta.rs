//! Classified differences between new findings and stored knowledge.

use serde::{Deserialize, Serialize};

use super::FieldValue;

/// Ordinal severity of a change. Ordered `Noise < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Significance {
    Noise,
    Low,
    Medium,
    High,
}

impl Significance {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noise => "NOISE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// Direction of a change relative to the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendDirection {
    /// Category was never seen before.
    New,
    Improving,
    Declining,
    Stable,
}

impl TrendDirection {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Improving => "IMPROVING",
            Self::Declining => "DECLINING",
            Self::Stable => "STABLE",
        }
    }
}

/// One classified difference for one category in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Category the change applies to.
    pub category: String,
    /// Stored value before this run, `None` for a new category.
    pub old_value: Option<FieldValue>,
    /// Verified value reported this run.
    pub new_value: FieldValue,
    pub significance: Significance,
    pub trend_direction: TrendDirection,
    /// Human-readable description of what changed.
    pub change: String,
    /// Source the new value was attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

impl Delta {
    /// Whether this delta gates the re-evaluation stage.
    #[must_use]
    pub fn is_high(&self) -> bool {
        self.significance == Significance::High
    }

    /// Whether this delta is significant enough to replace non-numeric values
    /// and to be folded into the record's change log.
    #[must_use]
    pub fn is_material(&self) -> bool {
        self.significance >= Significance::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance_ordering() {
        assert!(Significance::Noise < Significance::Low);
        assert!(Significance::Low < Significance::Medium);
        assert!(Significance::Medium < Significance::High);
        assert_eq!(
            [Significance::Low, Significance::High, Significance::Noise]
                .into_iter()
                .max(),
            Some(Significance::High)
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&Significance::High).unwrap(),
            "\"HIGH\""
        );
        assert_eq!(
            serde_json::to_string(&TrendDirection::Improving).unwrap(),
            "\"IMPROVING\""
        );
        assert_eq!(Significance::Medium.as_str(), "MEDIUM");
        assert_eq!(TrendDirection::New.as_str(), "NEW");
    }

    #[test]
    fn test_delta_materiality() {
        let delta = Delta {
            category: "medianIncome".to_string(),
            old_value: Some(FieldValue::Number(8000.0)),
            new_value: FieldValue::Number(8200.0),
            significance: Significance::Low,
            trend_direction: TrendDirection::Improving,
            change: "medianIncome 8000 -> 8200".to_string(),
            source_ref: None,
        };
        assert!(!delta.is_high());
        assert!(!delta.is_material());

        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["significance"], "LOW");
        assert!(json.get("source_ref").is_none());
    }
}
