//! Multi-provider generative model client for re-evaluation and dossiers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::{AiConfig, ProviderKind};
use crate::knowledge::{AnalysisView, Delta, KnowledgeRecord};
use crate::pipeline::{Dossier, DossierGenerator, EvaluationDraft, GenerationError, Reevaluator};

use super::prompts::{
    format_dossier_request, format_reevaluation_request, DOSSIER_SYSTEM_PROMPT,
    REEVALUATION_SYSTEM_PROMPT,
};

/// Connection timeout for HTTP requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall request timeout; generation is slow.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Number of recommendations kept from a re-evaluation.
const MAX_RECOMMENDATIONS: usize = 3;

fn build_http_client() -> Result<Client, AiError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AiError::RequestFailed(e.to_string()))
}

/// Determine if a request should be retried based on status code and attempt count.
fn should_retry(status_code: u16, attempt: u32) -> bool {
    if attempt >= MAX_RETRIES {
        return false;
    }
    (500..600).contains(&status_code)
}

/// Exponential backoff: 1s, 2s, 4s.
fn calculate_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

/// Errors from AI client operations.
#[derive(Error, Debug)]
pub enum AiError {
    #[error("API key not configured (env: {0})")]
    MissingApiKey(String),
    #[error("API request failed: {0}")]
    RequestFailed(String),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("AI request timed out")]
    Timeout,
}

impl From<AiError> for GenerationError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::MissingApiKey(_) => Self::Unavailable(err.to_string()),
            AiError::ParseError(_) => Self::InvalidResponse(err.to_string()),
            AiError::RequestFailed(_) | AiError::Timeout => Self::Request(err.to_string()),
        }
    }
}

/// Send a JSON request, retrying server errors, and return the response body.
async fn send_with_retry(request: impl Fn() -> RequestBuilder) -> Result<serde_json::Value, AiError> {
    let mut attempt = 0;
    loop {
        let response = request().send().await.map_err(|e| {
            if e.is_timeout() {
                AiError::Timeout
            } else {
                AiError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AiError::ParseError(e.to_string()));
        }

        if should_retry(status.as_u16(), attempt) {
            let backoff = calculate_backoff(attempt);
            tracing::debug!(%status, attempt, backoff_secs = backoff.as_secs(), "Retrying model request");
            tokio::time::sleep(backoff).await;
            attempt += 1;
            continue;
        }

        let text = response.text().await.unwrap_or_default();
        return Err(AiError::RequestFailed(format!("HTTP {status}: {text}")));
    }
}

/// A text generation backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, AiError>;
}

/// Gemini API provider.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl GeminiProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
    ) -> Result<Self, AiError> {
        Ok(Self {
            client: build_http_client()?,
            base_url,
            api_key,
            model,
            max_tokens,
        })
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    async fn generate(&self, system: &str, user: &str) -> Result<String, AiError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": user }]
            }],
            "systemInstruction": {
                "parts": [{ "text": system }]
            },
            "generationConfig": {
                "maxOutputTokens": self.max_tokens
            }
        });

        let json = send_with_retry(|| {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;

        json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AiError::ParseError("No text in Gemini response".to_string()))
    }
}

/// Claude API provider.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
    ) -> Result<Self, AiError> {
        Ok(Self {
            client: build_http_client()?,
            base_url,
            api_key,
            model,
            max_tokens,
        })
    }
}

#[async_trait]
impl AiProvider for ClaudeProvider {
    async fn generate(&self, system: &str, user: &str) -> Result<String, AiError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{
                "role": "user",
                "content": user
            }]
        });

        let json = send_with_retry(|| {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
        })
        .await?;

        json["content"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AiError::ParseError("No text in Claude response".to_string()))
    }
}

/// Provider enum for dispatch.
#[derive(Debug, Clone)]
pub enum Provider {
    Gemini(GeminiProvider),
    Claude(ClaudeProvider),
}

#[async_trait]
impl AiProvider for Provider {
    async fn generate(&self, system: &str, user: &str) -> Result<String, AiError> {
        match self {
            Self::Gemini(p) => p.generate(system, user).await,
            Self::Claude(p) => p.generate(system, user).await,
        }
    }
}

/// Model-backed re-evaluator and dossier generator.
#[derive(Debug, Clone)]
pub struct AiClient {
    provider: Provider,
    config: AiConfig,
}

impl AiClient {
    #[must_use]
    pub fn new(provider: Provider, config: AiConfig) -> Self {
        Self { provider, config }
    }

    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AiError::MissingApiKey` if the configured API key environment
    /// variable is not set.
    pub fn from_config(config: AiConfig) -> Result<Self, AiError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| AiError::MissingApiKey(config.api_key_env.clone()))?;

        let provider = match config.provider {
            ProviderKind::Gemini => Provider::Gemini(GeminiProvider::new(
                config.base_url.clone(),
                api_key,
                config.model.clone(),
                config.max_tokens,
            )?),
            ProviderKind::Claude => Provider::Claude(ClaudeProvider::new(
                config.base_url.clone(),
                api_key,
                config.model.clone(),
                config.max_tokens,
            )?),
        };

        Ok(Self { provider, config })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.config.model
    }

    #[must_use]
    pub fn provider_kind(&self) -> &ProviderKind {
        &self.config.provider
    }
}

#[async_trait]
impl Reevaluator for AiClient {
    async fn reevaluate(
        &self,
        record: &KnowledgeRecord,
        high: &[Delta],
    ) -> Result<EvaluationDraft, GenerationError> {
        tracing::info!(entity = %record.entity, high = high.len(), model = self.model(), "Re-evaluating");
        let text = self
            .provider
            .generate(REEVALUATION_SYSTEM_PROMPT, &format_reevaluation_request(record, high))
            .await?;
        let mut draft: EvaluationDraft = extract_json(&text)?;
        draft.recommendations.truncate(MAX_RECOMMENDATIONS);
        Ok(draft)
    }
}

#[async_trait]
impl DossierGenerator for AiClient {
    async fn generate(&self, view: &AnalysisView, topic: &str) -> Result<Dossier, GenerationError> {
        let text = self
            .provider
            .generate(DOSSIER_SYSTEM_PROMPT, &format_dossier_request(view, topic))
            .await?;
        let mut dossier: Dossier = extract_json(&text)?;
        if dossier.business_type.trim().is_empty() {
            dossier.business_type = topic.to_string();
        }
        tracing::info!(entity = %view.entity, topic, score = dossier.opportunity_score, "Dossier generated");
        Ok(dossier)
    }
}

/// Extract the first JSON object or array from model output.
///
/// Markdown fences and surrounding prose are ignored.
///
/// # Errors
///
/// Returns `AiError::ParseError` if no JSON value is found or parsing fails.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, AiError> {
    let start = text
        .find(['{', '['])
        .ok_or_else(|| AiError::ParseError(format!("No JSON found in response: {text}")))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(start + i + c.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| AiError::ParseError("Unterminated JSON in response".to_string()))?;
    serde_json::from_str(&text[start..end])
        .map_err(|e| AiError::ParseError(format!("Failed to parse JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_should_retry_logic() {
        assert!(should_retry(500, 0));
        assert!(should_retry(503, 2));
        assert!(!should_retry(500, MAX_RETRIES));
        assert!(!should_retry(400, 0));
        assert!(!should_retry(429, 0));
        assert!(!should_retry(200, 0));
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0).as_secs(), 1);
        assert_eq!(calculate_backoff(1).as_secs(), 2);
        assert_eq!(calculate_backoff(2).as_secs(), 4);
    }

    #[test]
    fn test_extract_json_from_fenced_output() {
        let text = "Here you go:\n```json\n{\"summary\": \"Rents up {sharply}\", \"recommendations\": []}\n```";
        let draft: EvaluationDraft = extract_json(text).unwrap();
        assert_eq!(draft.summary, "Rents up {sharply}");
    }

    #[test]
    fn test_extract_json_array() {
        let values: Vec<serde_json::Value> = extract_json("[{\"a\": [1, 2]}, {\"b\": 3}] done").unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_extract_json_errors() {
        assert!(extract_json::<serde_json::Value>("No JSON here").is_err());
        assert!(extract_json::<serde_json::Value>("{\"open\": ").is_err());
    }

    #[test]
    fn test_ai_error_maps_to_generation_error() {
        let err: GenerationError = AiError::MissingApiKey("GEMINI_API_KEY".into()).into();
        assert!(matches!(err, GenerationError::Unavailable(_)));
        let err: GenerationError = AiError::ParseError("bad".into()).into();
        assert!(matches!(err, GenerationError::InvalidResponse(_)));
        let err: GenerationError = AiError::Timeout.into();
        assert!(matches!(err, GenerationError::Request(_)));
    }

    #[test]
    fn test_from_config_missing_key() {
        let config = AiConfig {
            api_key_env: "HEARTLAND_TEST_MISSING_KEY".to_string(),
            ..AiConfig::default()
        };
        let result = AiClient::from_config(config);
        assert!(matches!(result, Err(AiError::MissingApiKey(_))));
    }

    #[test]
    fn test_from_config_claude() {
        std::env::set_var("HEARTLAND_TEST_CLAUDE_KEY", "test-key");
        let config = AiConfig {
            provider: ProviderKind::Claude,
            model: "claude-test".to_string(),
            max_tokens: 2048,
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: "HEARTLAND_TEST_CLAUDE_KEY".to_string(),
        };
        let client = AiClient::from_config(config).unwrap();
        assert!(matches!(client.provider, Provider::Claude(_)));
        assert_eq!(client.model(), "claude-test");
    }

    async fn claude_stub(
        State(calls): State<Arc<AtomicU32>>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})));
        }
        let text = r#"{"businessType": "Pilates studio", "opportunityScore": 72, "category": "Wellness"}"#;
        (
            StatusCode::OK,
            Json(serde_json::json!({ "content": [{ "type": "text", "text": text }] })),
        )
    }

    #[tokio::test]
    async fn test_dossier_generation_retries_server_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route("/v1/messages", post(claude_stub))
            .with_state(Arc::clone(&calls));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = ClaudeProvider::new(
            format!("http://{addr}"),
            "test-key".into(),
            "claude-test".into(),
            1024,
        )
        .unwrap();
        let client = AiClient::new(Provider::Claude(provider), AiConfig::default());
        let view = KnowledgeRecord::new("Bedok", chrono::Utc::now()).projection();

        let dossier = DossierGenerator::generate(&client, &view, "Pilates").await.unwrap();
        assert_eq!(dossier.business_type, "Pilates studio");
        assert_eq!(dossier.category, "Wellness");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
