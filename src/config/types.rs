//! Configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::knowledge::Significance;

use super::ConfigError;

/// Which way a directional category moves when it improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

/// Delta classification policy.
///
/// Thresholds are relative changes (`|new - old| / |old|`). Changes at or
/// above `high_threshold` are HIGH, at or above `medium_threshold` MEDIUM, at
/// or above `low_threshold` LOW, and NOISE below that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub low_threshold: f64,
    /// Significance of a changed text/categorical value.
    pub categorical_change: Significance,
    /// Significance of a category seen for the first time on an incremental run.
    pub new_category: Significance,
    /// Significance of every category on a cold-start run.
    pub cold_start: Significance,
    /// Categories whose direction of change is meaningful.
    pub directional: BTreeMap<String, Polarity>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.15,
            medium_threshold: 0.05,
            low_threshold: 0.01,
            categorical_change: Significance::Medium,
            new_category: Significance::Medium,
            cold_start: Significance::High,
            directional: [
                ("medianIncome", Polarity::HigherIsBetter),
                ("residentPopulation", Polarity::HigherIsBetter),
                ("occupancyRate", Polarity::HigherIsBetter),
                ("vacancyRate", Polarity::LowerIsBetter),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        }
    }
}

/// Knowledge merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Smoothing weight of the new value on cold-start runs.
    pub alpha_cold_start: f64,
    /// Smoothing weight of the new value on incremental runs.
    pub alpha_incremental: f64,
    /// Confidence assigned to a category on its first verified observation.
    pub initial_confidence: f64,
    /// Fraction of the remaining gap to 1 gained per verified observation.
    pub confidence_gain: f64,
    /// Fraction of the gap to the floor lost per failed observation.
    pub confidence_decay: f64,
    pub confidence_floor: f64,
    pub max_list_items: usize,
    pub max_pulse_entries: usize,
    pub max_sources: usize,
    pub max_change_log: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            alpha_cold_start: 0.9,
            alpha_incremental: 0.3,
            initial_confidence: 0.5,
            confidence_gain: 0.25,
            confidence_decay: 0.5,
            confidence_floor: 0.1,
            max_list_items: 50,
            max_pulse_entries: 50,
            max_sources: 20,
            max_change_log: 100,
        }
    }
}

/// Findings schema settings applied at the delta detector boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Per-category fields whose values form a list item's identity key.
    pub identity_fields: BTreeMap<String, Vec<String>>,
    /// Fields tried, in order, when a category has no explicit identity fields.
    pub fallback_identity_fields: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            identity_fields: [
                ("activeTenders", vec!["block", "street"]),
                ("pulseTimeline", vec!["timestamp", "event"]),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
            .collect(),
            fallback_identity_fields: ["id", "key", "uri", "url", "name", "title"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Run scoping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// A record whose categories are all older than this forces a cold start.
    pub stale_after_hours: u64,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: 720,
        }
    }
}

impl ScopeConfig {
    /// Staleness threshold as a chrono duration.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Collector pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool-wide deadline for all collectors of one run.
    pub timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Source verifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Effective confidence of a claim whose source did not verify.
    pub low_confidence_floor: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            low_confidence_floor: 0.1,
        }
    }
}

/// An HTTP-backed collector definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Node name in the pipeline graph.
    pub name: String,
    /// Provenance source identifier.
    pub source_id: String,
    /// URL template; `{entity}` is replaced with the percent-encoded entity.
    pub url: String,
    /// Categories this collector reports.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Minimum age before an incremental run re-fetches (0 = always).
    #[serde(default)]
    pub refresh_hours: u64,
    /// Title used for grounding sources.
    #[serde(default)]
    pub title: Option<String>,
}

/// Generative model provider kind.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    Claude,
}

/// Configuration for the generative model used by re-evaluation and dossiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whether to enable permissive CORS.
    pub cors_permissive: bool,
}

/// Default port for the HTTP server.
pub const DEFAULT_PORT: u16 = 8000;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            cors_permissive: true,
        }
    }
}

/// Knowledge store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path; defaults to [`crate::store::default_store_path`].
    pub path: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarathonConfig {
    pub policy: PolicyConfig,
    pub merge: MergeConfig,
    pub schema: SchemaConfig,
    pub scope: ScopeConfig,
    pub pool: PoolConfig,
    pub verifier: VerifierConfig,
    pub collectors: Vec<CollectorConfig>,
    pub ai: AiConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_fraction(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside [0, 1]")))
    }
}

impl MarathonConfig {
    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy = &self.policy;
        for (field, value) in [
            ("policy.high_threshold", policy.high_threshold),
            ("policy.medium_threshold", policy.medium_threshold),
            ("policy.low_threshold", policy.low_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(field, format!("{value} is not a positive number")));
            }
        }
        if policy.high_threshold <= policy.medium_threshold
            || policy.medium_threshold <= policy.low_threshold
        {
            return Err(invalid(
                "policy",
                "thresholds must satisfy high > medium > low",
            ));
        }

        let merge = &self.merge;
        check_fraction("merge.alpha_cold_start", merge.alpha_cold_start)?;
        check_fraction("merge.alpha_incremental", merge.alpha_incremental)?;
        check_fraction("merge.initial_confidence", merge.initial_confidence)?;
        check_fraction("merge.confidence_gain", merge.confidence_gain)?;
        check_fraction("merge.confidence_decay", merge.confidence_decay)?;
        check_fraction("merge.confidence_floor", merge.confidence_floor)?;
        if merge.confidence_floor > merge.initial_confidence {
            return Err(invalid(
                "merge.confidence_floor",
                "must not exceed merge.initial_confidence",
            ));
        }
        check_fraction(
            "verifier.low_confidence_floor",
            self.verifier.low_confidence_floor,
        )?;

        if self.pool.timeout_secs == 0 {
            return Err(invalid("pool.timeout_secs", "must be at least 1"));
        }

        let mut names = std::collections::BTreeSet::new();
        for collector in &self.collectors {
            if collector.name.trim().is_empty() {
                return Err(invalid("collectors.name", "must not be empty"));
            }
            if !names.insert(collector.name.as_str()) {
                return Err(invalid(
                    "collectors.name",
                    format!("{} is defined twice", collector.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MarathonConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MarathonConfig::default();
        config.merge.alpha_incremental = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("merge.alpha_incremental"));

        let mut config = MarathonConfig::default();
        config.policy.medium_threshold = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "policy"
        ));

        let mut config = MarathonConfig::default();
        config.merge.confidence_gain = -0.1;
        assert!(config.validate().is_err());

        let mut config = MarathonConfig::default();
        config.policy.low_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = MarathonConfig::default();
        config.pool.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_collectors() {
        let collector = CollectorConfig {
            name: "demographics_agent".into(),
            source_id: "singstat".into(),
            url: "https://example.test/{entity}".into(),
            categories: Vec::new(),
            refresh_hours: 0,
            title: None,
        };
        let config = MarathonConfig {
            collectors: vec![collector.clone(), collector],
            ..MarathonConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_stale_after_saturates() {
        let scope = ScopeConfig {
            stale_after_hours: u64::MAX,
        };
        assert_eq!(scope.stale_after(), chrono::Duration::MAX);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = PolicyConfig::default();
        assert!(policy.high_threshold > policy.medium_threshold);
        assert!(policy.medium_threshold > policy.low_threshold);
        assert_eq!(policy.cold_start, Significance::High);
        assert_eq!(
            policy.directional.get("medianIncome"),
            Some(&Polarity::HigherIsBetter)
        );
    }

    #[test]
    fn test_merge_defaults_are_bounded() {
        let merge = MergeConfig::default();
        assert!(merge.alpha_cold_start > merge.alpha_incremental);
        assert!((0.0..=1.0).contains(&merge.initial_confidence));
        assert!(merge.confidence_floor < merge.initial_confidence);
        assert_eq!(merge.max_change_log, 100);
        assert_eq!(merge.max_sources, 20);
    }

    #[test]
    fn test_ai_config_defaults() {
        let config = AiConfig::default();
        assert_eq!(config.provider, ProviderKind::Gemini);
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.api_key_env, "GEMINI_API_KEY");
    }

    #[test]
    fn test_deserialize_partial_config() {
        let toml = r#"
            [policy]
            high_threshold = 0.25
            categorical_change = "HIGH"

            [policy.directional]
            rentPsf = "lower_is_better"

            [merge]
            alpha_incremental = 0.4

            [[collectors]]
            name = "demographics_agent"
            source_id = "singstat_demographics"
            url = "https://example.test/{entity}/demographics"
            categories = ["medianIncome", "residentPopulation"]
            refresh_hours = 168
        "#;
        let config: MarathonConfig = toml::from_str(toml).unwrap();
        assert!((config.policy.high_threshold - 0.25).abs() < f64::EPSILON);
        assert!((config.policy.medium_threshold - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.policy.categorical_change, Significance::High);
        assert_eq!(
            config.policy.directional.get("rentPsf"),
            Some(&Polarity::LowerIsBetter)
        );
        assert!((config.merge.alpha_incremental - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.merge.max_list_items, 50);
        assert_eq!(config.collectors.len(), 1);
        assert_eq!(config.collectors[0].refresh_hours, 168);
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_scope_stale_after() {
        let scope = ScopeConfig {
            stale_after_hours: 48,
        };
        assert_eq!(scope.stale_after(), chrono::Duration::hours(48));
        assert_eq!(PoolConfig::default().timeout(), Duration::from_secs(60));
    }
}
