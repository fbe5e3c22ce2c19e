//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use heartland_marathon::collector::{
    Claim, CollectContext, Collector, CollectorError, CollectorOutput, CollectorPool,
    ProvenanceEnvelope,
};
use heartland_marathon::config::MarathonConfig;
use heartland_marathon::pipeline::Orchestrator;
use heartland_marathon::store::KnowledgeStore;

/// A collector that plays back one scripted output per run.
///
/// The last output repeats once the script runs out.
pub struct ScriptedCollector {
    name: String,
    categories: Vec<String>,
    delay: Duration,
    script: Mutex<VecDeque<CollectorOutput>>,
    last: Mutex<Option<CollectorOutput>>,
}

impl ScriptedCollector {
    pub fn new(name: &str, categories: &[&str], script: Vec<CollectorOutput>) -> Self {
        Self {
            name: name.to_string(),
            categories: categories.iter().map(|c| (*c).to_string()).collect(),
            delay: Duration::ZERO,
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn categories(&self) -> &[String] {
        &self.categories
    }

    async fn collect(&self, _ctx: &CollectContext) -> Result<CollectorOutput, CollectorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(output) = next {
            *last = Some(output);
        }
        Ok(last.clone().unwrap_or_default())
    }
}

/// Output with verified claims from a single source.
pub fn verified(source_id: &str, claims: &[(&str, Value)]) -> CollectorOutput {
    CollectorOutput {
        claims: claims
            .iter()
            .map(|(category, value)| Claim::new(*category, value.clone(), source_id))
            .collect(),
        provenance: vec![ProvenanceEnvelope::verified(source_id, None)],
        ..CollectorOutput::default()
    }
}

/// Output whose claims cite a source that failed to fetch.
pub fn unverified(source_id: &str, error: &str, claims: &[(&str, Value)]) -> CollectorOutput {
    CollectorOutput {
        provenance: vec![ProvenanceEnvelope::unavailable(source_id, error)],
        ..verified(source_id, claims)
    }
}

/// An orchestrator over a file-backed store in a temporary directory.
pub async fn orchestrator(
    collectors: Vec<Arc<dyn Collector>>,
    config: MarathonConfig,
) -> (Orchestrator, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path().join("knowledge.db"))
        .await
        .unwrap();
    let pool = CollectorPool::new(collectors, config.pool.timeout());
    (Orchestrator::new(store, pool, config), dir)
}
