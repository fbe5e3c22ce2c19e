//! Collector backed by a JSON HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::config::CollectorConfig;
use crate::knowledge::{GroundingSource, PulseEntry};

use super::{
    Claim, CollectContext, Collector, CollectorError, CollectorOutput, ProvenanceEnvelope,
};

/// Connection timeout for source requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request timeout for source requests.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 2;

fn should_retry(status_code: u16, attempt: u32) -> bool {
    if attempt >= MAX_RETRIES {
        return false;
    }
    (500..600).contains(&status_code)
}

/// Exponential backoff: 500ms, 1s, 2s.
fn calculate_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 << attempt)
}

/// Substitute the percent-encoded entity into a URL template.
fn render_url(template: &str, entity: &str) -> Result<Url, CollectorError> {
    let encoded = url::form_urlencoded::byte_serialize(entity.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    Url::parse(&template.replace("{entity}", &encoded))
        .map_err(|e| CollectorError::Config(format!("invalid url template {template}: {e}")))
}

/// Fetches one JSON document per run and turns its fields into claims.
///
/// The document is either `{"findings": {...}, "pulse": [...], "sources": [...]}`
/// or a flat object of category values. Only declared categories become
/// claims, unless none are declared.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client,
    config: CollectorConfig,
}

impl HttpCollector {
    /// Build a collector from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::Config` if the URL template is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: CollectorConfig) -> Result<Self, CollectorError> {
        render_url(&config.url, "entity")?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn unavailable(&self, error: impl Into<String>, url: &Url) -> CollectorError {
        CollectorError::Unavailable {
            source_id: self.config.source_id.clone(),
            error: error.into(),
            raw_url: Some(url.to_string()),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<serde_json::Value, CollectorError> {
        let mut attempt = 0;
        loop {
            let response = self.client.get(url.clone()).send().await.map_err(|e| {
                if e.is_timeout() {
                    self.unavailable(format!("timeout_{}s", FETCH_TIMEOUT.as_secs()), url)
                } else {
                    self.unavailable(format!("request_failed: {e}"), url)
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| self.unavailable(format!("invalid_json: {e}"), url));
            }

            let status_code = status.as_u16();
            if should_retry(status_code, attempt) {
                tracing::debug!(
                    collector = %self.config.name,
                    status = status_code,
                    attempt,
                    "Retrying source fetch"
                );
                tokio::time::sleep(calculate_backoff(attempt)).await;
                attempt += 1;
                continue;
            }

            return Err(self.unavailable(format!("http_{status_code}"), url));
        }
    }

    fn parse_document(&self, document: &serde_json::Value, url: &Url) -> CollectorOutput {
        let findings = document
            .get("findings")
            .and_then(serde_json::Value::as_object)
            .or_else(|| document.as_object());

        let mut claims = Vec::new();
        if let Some(findings) = findings {
            for (category, value) in findings {
                if matches!(category.as_str(), "findings" | "pulse" | "sources") {
                    continue;
                }
                let declared = self.config.categories.is_empty()
                    || self.config.categories.iter().any(|c| c == category);
                if declared {
                    claims.push(Claim::new(
                        category.clone(),
                        value.clone(),
                        self.config.source_id.clone(),
                    ));
                }
            }
        }

        let pulse = parse_list::<PulseEntry>(document.get("pulse"), &self.config.name, "pulse")
            .into_iter()
            .map(|mut entry| {
                entry.source_id.get_or_insert_with(|| self.config.source_id.clone());
                entry
            })
            .collect();

        let mut sources =
            parse_list::<GroundingSource>(document.get("sources"), &self.config.name, "sources");
        sources.push(GroundingSource {
            title: self
                .config
                .title
                .clone()
                .unwrap_or_else(|| self.config.source_id.clone()),
            uri: url.to_string(),
        });

        CollectorOutput {
            claims,
            provenance: vec![ProvenanceEnvelope::verified(
                self.config.source_id.clone(),
                Some(url.to_string()),
            )],
            pulse,
            sources,
        }
    }
}

/// Parse each element independently; malformed elements are dropped.
fn parse_list<T: serde::de::DeserializeOwned>(
    value: Option<&serde_json::Value>,
    collector: &str,
    field: &str,
) -> Vec<T> {
    let Some(items) = value.and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(collector, field, error = %e, "Dropping malformed item");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Collector for HttpCollector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn categories(&self) -> &[String] {
        &self.config.categories
    }

    fn refresh_interval(&self) -> chrono::Duration {
        i64::try_from(self.config.refresh_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectorError> {
        let url = render_url(&self.config.url, &ctx.entity)?;
        tracing::debug!(collector = %self.config.name, url = %url, "Fetching source");
        let document = self.fetch(&url).await?;
        Ok(self.parse_document(&document, &url))
    }
}
