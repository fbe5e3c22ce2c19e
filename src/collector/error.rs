use std::time::Duration;

use thiserror::Error;

use super::ProvenanceEnvelope;

/// Errors a collector can report for a whole collection attempt.
///
/// None of these are fatal to a run: the pool turns each into an
/// UNAVAILABLE provenance envelope.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("source {source_id} unavailable: {error}")]
    Unavailable {
        source_id: String,
        error: String,
        raw_url: Option<String>,
    },

    #[error("collector {collector} exceeded the pool deadline of {}s", timeout.as_secs())]
    Timeout {
        collector: String,
        timeout: Duration,
    },

    #[error("collector {collector} panicked")]
    Panicked { collector: String },

    #[error("invalid collector configuration: {0}")]
    Config(String),
}

impl CollectorError {
    /// Short error code recorded in provenance envelopes.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Unavailable { error, .. } => error.clone(),
            Self::Timeout { timeout, .. } => format!("timeout_{}s", timeout.as_secs()),
            Self::Panicked { .. } => "collector_panicked".to_string(),
            Self::Config(_) => "invalid_config".to_string(),
        }
    }

    /// Convert into a failed envelope, attributing it to `default_source`
    /// when the error does not name a source.
    #[must_use]
    pub fn into_envelope(self, default_source: &str) -> ProvenanceEnvelope {
        let code = self.code();
        match self {
            Self::Unavailable {
                source_id, raw_url, ..
            } => {
                let envelope = ProvenanceEnvelope::unavailable(source_id, code);
                match raw_url {
                    Some(url) => envelope.with_url(url),
                    None => envelope,
                }
            }
            _ => ProvenanceEnvelope::unavailable(default_source, code),
        }
    }
}
