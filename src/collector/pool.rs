//! Concurrent collector fan-out with a pool-wide deadline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{CollectContext, CollectorError, CollectorOutput};

/// A data source adapter that investigates one slice of an entity.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Node name in the pipeline graph.
    fn name(&self) -> &str;

    /// Categories this collector reports. Used for scoping and to mark
    /// categories UNAVAILABLE when the collector fails outright.
    fn categories(&self) -> &[String];

    /// Minimum age of the collector's categories before an incremental run
    /// fetches them again. Zero means every run.
    fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::zero()
    }

    /// Collect claims and provenance for the entity.
    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectorError>;
}

/// How a collector finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStatus {
    Completed,
    Failed,
    TimedOut,
}

/// Result of one collector in one run.
#[derive(Debug, Clone)]
pub struct CollectorOutcome {
    pub collector: String,
    pub categories: Vec<String>,
    pub status: CollectorStatus,
    pub output: CollectorOutput,
    pub error: Option<String>,
    pub elapsed: Duration,
    index: usize,
}

impl CollectorOutcome {
    fn from_result(
        index: usize,
        collector: &dyn Collector,
        result: Result<CollectorOutput, CollectorError>,
        elapsed: Duration,
    ) -> Self {
        let name = collector.name().to_string();
        let categories = collector.categories().to_vec();
        match result {
            Ok(output) => Self {
                collector: name,
                categories,
                status: CollectorStatus::Completed,
                output,
                error: None,
                elapsed,
                index,
            },
            Err(err) => Self::failed(index, name, categories, err, elapsed),
        }
    }

    fn failed(
        index: usize,
        collector: String,
        categories: Vec<String>,
        err: CollectorError,
        elapsed: Duration,
    ) -> Self {
        let status = if matches!(err, CollectorError::Timeout { .. }) {
            CollectorStatus::TimedOut
        } else {
            CollectorStatus::Failed
        };
        let message = err.to_string();
        let envelope = err.into_envelope(&collector);
        Self {
            collector,
            categories,
            status,
            output: CollectorOutput::unavailable(envelope),
            error: Some(message),
            elapsed,
            index,
        }
    }

    /// Outcome of a collector that finished normally.
    #[must_use]
    pub fn completed(
        collector: impl Into<String>,
        categories: Vec<String>,
        output: CollectorOutput,
        elapsed: Duration,
    ) -> Self {
        Self {
            collector: collector.into(),
            categories,
            status: CollectorStatus::Completed,
            output,
            error: None,
            elapsed,
            index: 0,
        }
    }

    /// Outcome of a collector that produced nothing.
    #[must_use]
    pub fn from_error(
        collector: impl Into<String>,
        categories: Vec<String>,
        err: CollectorError,
        elapsed: Duration,
    ) -> Self {
        Self::failed(0, collector.into(), categories, err, elapsed)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CollectorStatus::Completed
    }
}

/// The set of collectors available to the orchestrator.
#[derive(Clone)]
pub struct CollectorPool {
    collectors: Vec<Arc<dyn Collector>>,
    timeout: Duration,
}

impl std::fmt::Debug for CollectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorPool")
            .field(
                "collectors",
                &self.collectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CollectorPool {
    #[must_use]
    pub fn new(collectors: Vec<Arc<dyn Collector>>, timeout: Duration) -> Self {
        Self {
            collectors,
            timeout,
        }
    }

    #[must_use]
    pub fn collectors(&self) -> &[Arc<dyn Collector>] {
        &self.collectors
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the named collectors concurrently.
    ///
    /// Every collector is bounded by the same deadline; one that has not
    /// finished by then reports a timeout instead of blocking the run.
    #[must_use]
    pub fn spawn(&self, selected: &[String], ctx: &CollectContext) -> PoolRun {
        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        let mut join_set = JoinSet::new();
        let mut launched = Vec::new();

        for collector in self
            .collectors
            .iter()
            .filter(|c| selected.iter().any(|name| name == c.name()))
        {
            let index = launched.len();
            launched.push((collector.name().to_string(), collector.categories().to_vec()));

            let collector = Arc::clone(collector);
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let started = Instant::now();
                let result =
                    match tokio::time::timeout_at(deadline, collector.collect(&ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(CollectorError::Timeout {
                            collector: collector.name().to_string(),
                            timeout,
                        }),
                    };
                CollectorOutcome::from_result(index, collector.as_ref(), result, started.elapsed())
            });
        }

        tracing::debug!(
            entity = %ctx.entity,
            collectors = launched.len(),
            timeout_secs = timeout.as_secs(),
            "Collector pool started"
        );

        PoolRun {
            pending: (0..launched.len()).collect(),
            launched,
            join_set,
        }
    }
}

/// An in-flight fan-out. Yields outcomes in completion order.
pub struct PoolRun {
    join_set: JoinSet<CollectorOutcome>,
    launched: Vec<(String, Vec<String>)>,
    pending: BTreeSet<usize>,
}

impl PoolRun {
    /// Number of collectors launched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.launched.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.launched.is_empty()
    }

    /// Wait for the next collector to finish. Returns `None` once every
    /// launched collector has reported.
    pub async fn next(&mut self) -> Option<CollectorOutcome> {
        loop {
            match self.join_set.join_next().await {
                Some(Ok(outcome)) => {
                    self.pending.remove(&outcome.index);
                    return Some(outcome);
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "Collector task failed to join");
                }
                None => {
                    // Tasks that panicked never reported; surface them as failures.
                    let index = self.pending.pop_first()?;
                    let (name, categories) = self.launched[index].clone();
                    let err = CollectorError::Panicked {
                        collector: name.clone(),
                    };
                    return Some(CollectorOutcome::failed(
                        index,
                        name,
                        categories,
                        err,
                        Duration::ZERO,
                    ));
                }
            }
        }
    }

    /// Wait for every collector.
    pub async fn collect_all(mut self) -> Vec<CollectorOutcome> {
        let mut outcomes = Vec::with_capacity(self.len());
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Claim, FetchStatus, ProvenanceEnvelope};
    use crate::pipeline::Directive;
    use uuid::Uuid;

    struct FixedCollector {
        name: String,
        categories: Vec<String>,
        delay: Duration,
        panic: bool,
    }

    impl FixedCollector {
        fn new(name: &str, delay_ms: u64) -> Self {
            Self {
                name: name.to_string(),
                categories: vec![format!("{name}_category")],
                delay: Duration::from_millis(delay_ms),
                panic: false,
            }
        }
    }

    #[async_trait]
    impl Collector for FixedCollector {
        fn name(&self) -> &str {
            &self.name
        }

        fn categories(&self) -> &[String] {
            &self.categories
        }

        async fn collect(&self, _ctx: &CollectContext) -> Result<CollectorOutput, CollectorError> {
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("collector blew up");
            }
            Ok(CollectorOutput {
                claims: vec![Claim::new(
                    self.categories[0].clone(),
                    serde_json::json!(1),
                    self.name.clone(),
                )],
                provenance: vec![ProvenanceEnvelope::verified(self.name.clone(), None)],
                ..CollectorOutput::default()
            })
        }
    }

    fn ctx() -> CollectContext {
        CollectContext {
            run_id: Uuid::new_v4(),
            entity: "Bedok".into(),
            directive: Directive::ColdStart,
        }
    }

    fn pool(collectors: Vec<FixedCollector>, timeout_ms: u64) -> CollectorPool {
        CollectorPool::new(
            collectors
                .into_iter()
                .map(|c| Arc::new(c) as Arc<dyn Collector>)
                .collect(),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_outcomes_arrive_in_completion_order() {
        let pool = pool(
            vec![FixedCollector::new("slow", 80), FixedCollector::new("fast", 5)],
            1_000,
        );
        let names = vec!["slow".to_string(), "fast".to_string()];

        let outcomes = pool.spawn(&names, &ctx()).collect_all().await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].collector, "fast");
        assert_eq!(outcomes[1].collector, "slow");
        assert!(outcomes.iter().all(CollectorOutcome::is_success));
    }

    #[tokio::test]
    async fn test_straggler_times_out_without_blocking_others() {
        let pool = pool(
            vec![FixedCollector::new("hung", 5_000), FixedCollector::new("ok", 1)],
            50,
        );
        let names = vec!["hung".to_string(), "ok".to_string()];

        let outcomes = pool.spawn(&names, &ctx()).collect_all().await;

        let hung = outcomes.iter().find(|o| o.collector == "hung").unwrap();
        assert_eq!(hung.status, CollectorStatus::TimedOut);
        assert!(hung.output.claims.is_empty());
        assert_eq!(hung.output.provenance[0].fetch_status, FetchStatus::Unavailable);

        let ok = outcomes.iter().find(|o| o.collector == "ok").unwrap();
        assert!(ok.is_success());
    }

    #[tokio::test]
    async fn test_panicking_collector_is_reported_as_failed() {
        let mut bad = FixedCollector::new("bad", 1);
        bad.panic = true;
        let pool = pool(vec![bad, FixedCollector::new("good", 1)], 1_000);
        let names = vec!["bad".to_string(), "good".to_string()];

        let outcomes = pool.spawn(&names, &ctx()).collect_all().await;

        assert_eq!(outcomes.len(), 2);
        let bad = outcomes.iter().find(|o| o.collector == "bad").unwrap();
        assert_eq!(bad.status, CollectorStatus::Failed);
        assert_eq!(bad.categories, vec!["bad_category".to_string()]);
        assert_eq!(
            bad.output.provenance[0].error.as_deref(),
            Some("collector_panicked")
        );
    }

    #[tokio::test]
    async fn test_only_selected_collectors_run() {
        let pool = pool(
            vec![FixedCollector::new("a", 1), FixedCollector::new("b", 1)],
            1_000,
        );
        let run = pool.spawn(&["b".to_string()], &ctx());
        assert_eq!(run.len(), 1);

        let outcomes = run.collect_all().await;
        assert_eq!(outcomes[0].collector, "b");
    }
}
