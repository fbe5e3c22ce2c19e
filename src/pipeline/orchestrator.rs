//! The run orchestrator: the conditional execution graph of one run.
//!
//! ```text
//! marathon_observer -> collectors (parallel) -> source_verifier
//!   -> delta_detector -> knowledge_integrator -> [strategist] -> persist
//! ```
//!
//! The strategist node only runs when at least one HIGH delta was detected.
//! A failure anywhere aborts the run without writing the knowledge record.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::collector::{CollectContext, CollectorOutcome, CollectorPool};
use crate::config::MarathonConfig;
use crate::events::{EventDetail, EventHub, LogLevel, PipelineEvent, RunRecorder};
use crate::knowledge::{
    AnalysisView, ChangeLogEntry, Delta, Evaluation, Impact, KnowledgeRecord, PulseEntry,
};
use crate::store::KnowledgeStore;

use super::integrator::{IntegrationInput, KnowledgeIntegrator};
use super::scope;
use super::{
    consolidate, normalize_claim, verify, DeltaDetector, DigestReevaluator, Dossier,
    DossierGenerator, EntityGuard, EntityLocks, EntityStatus, PipelineError, ReevaluationOutcome,
    Reevaluator, Run, RunStatus, RunSummary, ToolCall, UnconfiguredGenerator, DELTA_NODE,
    INTEGRATOR_NODE, PERSIST_NODE, REEVALUATION_NODE, RUN_NODE, SCOPE_NODE, VERIFIER_NODE,
};

/// Reason recorded when the re-evaluation gate stays closed.
pub const NO_HIGH_CHANGES: &str = "No HIGH significance changes";

/// Longest accepted entity name.
const MAX_ENTITY_LEN: usize = 128;

/// Normalize a caller-supplied entity name.
///
/// # Errors
///
/// Returns `PipelineError::InvalidInput` for empty, overlong or
/// control-character names.
pub fn validate_entity(entity: &str) -> Result<String, PipelineError> {
    let entity = entity.trim();
    if entity.is_empty() {
        return Err(PipelineError::InvalidInput("entity is empty".to_string()));
    }
    if entity.chars().count() > MAX_ENTITY_LEN {
        return Err(PipelineError::InvalidInput(format!(
            "entity is longer than {MAX_ENTITY_LEN} characters"
        )));
    }
    if entity.chars().any(char::is_control) {
        return Err(PipelineError::InvalidInput(
            "entity contains control characters".to_string(),
        ));
    }
    Ok(entity.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Events a run may lose from its stored log before it is failed.
const MAX_LOST_EVENTS: u64 = 3;

fn checkpoint(cancel: &CancellationToken, recorder: &RunRecorder) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let lost = recorder.lost_events();
    if lost >= MAX_LOST_EVENTS {
        return Err(PipelineError::EventLog { lost });
    }
    Ok(())
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub entity: String,
    /// Every event of this run, from `run_started` to the terminal event.
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
    join: JoinHandle<Run>,
}

impl RunHandle {
    /// Wait for the run to finish. The returned run is `completed` or `failed`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::TaskFailed` if the run task panicked.
    pub async fn wait(self) -> Result<Run, PipelineError> {
        self.join
            .await
            .map_err(|e| PipelineError::TaskFailed(e.to_string()))
    }

    /// Detach from the run; it continues in the background.
    pub fn detach(self) -> Uuid {
        self.run_id
    }
}

/// Runs pipelines and serves the read side of the knowledge store.
#[derive(Clone)]
pub struct Orchestrator {
    store: KnowledgeStore,
    pool: Arc<CollectorPool>,
    config: Arc<MarathonConfig>,
    hub: EventHub,
    locks: EntityLocks,
    reevaluator: Arc<dyn Reevaluator>,
    dossiers: Arc<dyn DossierGenerator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("pool", &self.pool)
            .field("active", &self.locks.locked_entities())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator with the deterministic re-evaluator and no
    /// dossier generator.
    #[must_use]
    pub fn new(store: KnowledgeStore, pool: CollectorPool, config: MarathonConfig) -> Self {
        Self {
            store,
            pool: Arc::new(pool),
            config: Arc::new(config),
            hub: EventHub::default(),
            locks: EntityLocks::new(),
            reevaluator: Arc::new(DigestReevaluator),
            dossiers: Arc::new(UnconfiguredGenerator),
        }
    }

    #[must_use]
    pub fn with_reevaluator(mut self, reevaluator: Arc<dyn Reevaluator>) -> Self {
        self.reevaluator = reevaluator;
        self
    }

    #[must_use]
    pub fn with_dossier_generator(mut self, dossiers: Arc<dyn DossierGenerator>) -> Self {
        self.dossiers = dossiers;
        self
    }

    #[must_use]
    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    #[must_use]
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    #[must_use]
    pub fn config(&self) -> &MarathonConfig {
        &self.config
    }

    /// Live events of every run.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.hub.subscribe()
    }

    #[must_use]
    pub fn is_running(&self, entity: &str) -> bool {
        self.locks.is_locked(entity)
    }

    /// Id of the run currently holding an entity.
    #[must_use]
    pub fn active_run(&self, entity: &str) -> Option<Uuid> {
        self.locks.active_run(entity).and_then(|active| active.run_id)
    }

    /// Mark runs a previous process left open as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn recover_interrupted(&self) -> Result<usize, PipelineError> {
        let count = self.store.fail_interrupted_runs(Utc::now()).await?;
        if count > 0 {
            tracing::warn!(count, "Marked interrupted runs as failed");
        }
        Ok(count)
    }

    /// Start a run for an entity.
    ///
    /// Fails fast with `PipelineError::Conflict` if the entity already has an
    /// active run. The run executes on its own task; dropping the handle
    /// does not stop it.
    ///
    /// # Errors
    ///
    /// Returns `Conflict`, `InvalidInput`, or a store error if the run cannot
    /// be registered.
    pub async fn start_run(&self, entity: &str) -> Result<RunHandle, PipelineError> {
        let entity = validate_entity(entity)?;
        let guard = self
            .locks
            .try_acquire(&entity)
            .map_err(|active| PipelineError::Conflict {
                entity: entity.clone(),
                run_id: active.run_id,
            })?;

        let now = Utc::now();
        let prior = self.store.load_record(&entity).await?;
        let directive = scope::directive_for(prior.as_ref(), now, &self.config.scope);
        let run = self.store.begin_run(&entity, directive, now).await?;
        guard.bind(run.run_id);

        let (tx, events) = mpsc::unbounded_channel();
        let recorder = RunRecorder::new(run.run_id, self.store.clone(), self.hub.clone())
            .with_direct(tx);

        let span = tracing::info_span!(
            "run",
            entity = %entity,
            run_id = %run.run_id,
            run_number = run.run_number
        );
        let run_id = run.run_id;
        let this = self.clone();
        let join = tokio::spawn(this.execute(guard, prior, run, recorder).instrument(span));

        Ok(RunHandle {
            run_id,
            entity,
            events,
            join,
        })
    }

    /// Start a run and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::start_run`], plus `TaskFailed` if the run task panicked.
    pub async fn run(&self, entity: &str) -> Result<Run, PipelineError> {
        self.start_run(entity).await?.wait().await
    }

    /// Request cooperative cancellation of an active run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no active run has this id.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), PipelineError> {
        if self.locks.cancel(run_id) {
            tracing::info!(%run_id, "Run cancellation requested");
            Ok(())
        } else {
            Err(PipelineError::NotFound(format!("active run {run_id}")))
        }
    }

    async fn execute(
        self,
        guard: EntityGuard,
        prior: Option<KnowledgeRecord>,
        mut run: Run,
        mut recorder: RunRecorder,
    ) -> Run {
        recorder
            .emit(
                RUN_NODE,
                EventDetail::RunStarted {
                    entity: run.entity.clone(),
                    run_number: run.run_number,
                    directive: run.directive,
                },
            )
            .await;
        tracing::info!(directive = run.directive.as_str(), "Run started");

        let cancel = guard.cancel_token().clone();
        // A panicking stage still ends in `run_failed`.
        let result = AssertUnwindSafe(self.stages(&mut run, prior, &mut recorder, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(PipelineError::StagePanicked(panic_message(&*payload))));

        match result {
            Ok(()) => {
                let summary = run.summary.clone().unwrap_or_default();
                tracing::info!(
                    deltas = run.deltas.len(),
                    high = run.high_delta_count(),
                    "Run completed"
                );
                recorder
                    .emit(
                        RUN_NODE,
                        EventDetail::RunCompleted {
                            summary,
                            delta_count: run.deltas.len(),
                            high_delta_count: run.high_delta_count(),
                            reevaluated: matches!(
                                run.reevaluation,
                                Some(ReevaluationOutcome::Completed { .. })
                            ),
                        },
                    )
                    .await;
            }
            Err(err) => {
                let message = err.to_string();
                run.status = RunStatus::Failed;
                run.completed_at = Some(Utc::now());
                run.summary = None;
                run.error = Some(message.clone());
                if let Err(e) = self.store.fail_run(&run).await {
                    tracing::error!(error = %e, "Failed to record run failure");
                }
                tracing::warn!(error = %message, "Run failed");
                recorder
                    .emit(RUN_NODE, EventDetail::RunFailed { error: message })
                    .await;
            }
        }
        // The terminal event is recorded before the entity is released.
        drop(guard);
        run
    }

    async fn stages(
        &self,
        run: &mut Run,
        prior: Option<KnowledgeRecord>,
        recorder: &mut RunRecorder,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let prior = prior.as_ref();

        // Scoping.
        recorder
            .node_started(SCOPE_NODE, Some("Checking knowledge base".to_string()))
            .await;
        let plan = scope::plan(prior, self.pool.collectors(), run.directive, Utc::now());
        for reason in &plan.reasons {
            recorder.log(SCOPE_NODE, LogLevel::Info, reason.clone()).await;
        }
        recorder
            .node_completed(
                SCOPE_NODE,
                format!(
                    "{}: {} of {} collectors scheduled",
                    run.directive.as_str(),
                    plan.collectors.len(),
                    self.pool.collectors().len()
                ),
            )
            .await;
        for skipped in &plan.skipped {
            recorder
                .node_skipped(&skipped.collector, skipped.reason.clone())
                .await;
        }
        let selected = plan.collectors.clone();
        run.scope = Some(plan);
        checkpoint(cancel, recorder)?;

        // Collection.
        let outcomes = self.collect(run, &selected, recorder, cancel).await?;
        self.save_progress(run).await;
        checkpoint(cancel, recorder)?;

        // Verification.
        recorder.node_started(VERIFIER_NODE, None).await;
        let report = verify(&outcomes, &self.config.verifier);
        for flagged in &report.flagged {
            recorder
                .emit(
                    VERIFIER_NODE,
                    EventDetail::VerificationFlag {
                        category: flagged.claim.category.clone(),
                        source_id: flagged.claim.source_id.clone(),
                        fetch_status: flagged.fetch_status,
                        error: flagged.error.clone(),
                    },
                )
                .await;
        }
        recorder
            .node_completed(
                VERIFIER_NODE,
                format!(
                    "{} verified, {} failed, {} claims flagged",
                    report.summary.verified_count,
                    report.summary.failed_count,
                    report.summary.flagged_claims
                ),
            )
            .await;
        run.verification_summary = Some(report.summary.clone());
        self.save_progress(run).await;
        checkpoint(cancel, recorder)?;

        // Delta detection, behind the schema boundary.
        recorder.node_started(DELTA_NODE, None).await;
        let observed_at = Utc::now();
        let mut normalized = Vec::with_capacity(report.accepted.len());
        let mut malformed = BTreeSet::new();
        for claim in &report.accepted {
            match normalize_claim(claim, observed_at, &self.config.schema) {
                Ok(claim) => normalized.push(claim),
                Err(err) => {
                    recorder
                        .log(DELTA_NODE, LogLevel::Warn, err.to_string())
                        .await;
                    malformed.insert(err.category);
                }
            }
        }
        let findings = consolidate(normalized);
        let mut unavailable = report.unavailable_categories.clone();
        unavailable.extend(
            malformed
                .into_iter()
                .filter(|category| !findings.contains_key(category)),
        );

        let deltas = DeltaDetector::new(&self.config.policy).detect(prior, &findings, run.directive);
        for delta in &deltas {
            recorder
                .emit(DELTA_NODE, EventDetail::DeltaDetected(delta.clone()))
                .await;
        }
        run.deltas.clone_from(&deltas);
        self.save_progress(run).await;
        recorder
            .node_completed(
                DELTA_NODE,
                format!(
                    "{} changes detected ({} HIGH)",
                    deltas.len(),
                    run.high_delta_count()
                ),
            )
            .await;
        checkpoint(cancel, recorder)?;

        // Integration.
        recorder.node_started(INTEGRATOR_NODE, None).await;
        let mut record = KnowledgeIntegrator::new(&self.config.merge).integrate(
            &run.entity,
            prior,
            &IntegrationInput {
                run_id: run.run_id,
                run_number: run.run_number,
                directive: run.directive,
                now: observed_at,
                findings: &findings,
                deltas: &deltas,
                unavailable: &unavailable,
                pulse: &report.pulse,
                sources: &report.sources,
            },
        );
        recorder
            .node_completed(
                INTEGRATOR_NODE,
                format!(
                    "{} categories merged, {} unavailable",
                    findings.len(),
                    unavailable.len()
                ),
            )
            .await;
        checkpoint(cancel, recorder)?;

        // Conditional re-evaluation.
        let high: Vec<Delta> = deltas.iter().filter(|d| d.is_high()).cloned().collect();
        if high.is_empty() {
            recorder.node_skipped(REEVALUATION_NODE, NO_HIGH_CHANGES).await;
            run.reevaluation = Some(ReevaluationOutcome::Skipped {
                reason: NO_HIGH_CHANGES.to_string(),
            });
        } else {
            self.reevaluate(run, &mut record, &high, recorder, cancel)
                .await?;
        }
        checkpoint(cancel, recorder)?;

        // Persist.
        recorder.node_started(PERSIST_NODE, None).await;
        let verification = run.verification_summary.clone().unwrap_or_default();
        let mut summary = format!(
            "Run #{} complete. {} deltas detected. Verification: {} verified, {} failed.",
            run.run_number,
            run.deltas.len(),
            verification.verified_count,
            verification.failed_count
        );
        let lost = recorder.lost_events();
        if lost > 0 {
            summary.push_str(&format!(" {lost} events missing from the replay log."));
        }
        run.summary = Some(summary);
        run.result_ref = Some(format!("{}@{}", record.entity, record.total_runs));
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        self.store.commit_run(&record, run).await?;
        recorder
            .node_completed(
                PERSIST_NODE,
                format!("Knowledge base saved (run #{})", run.run_number),
            )
            .await;
        Ok(())
    }

    /// Make partial results visible to `get_run` while the run is active.
    async fn save_progress(&self, run: &Run) {
        if let Err(e) = self.store.save_run_progress(run).await {
            tracing::warn!(error = %e, "Failed to save run progress");
        }
    }

    /// Fan out to the scheduled collectors and wait at the fan-in point.
    async fn collect(
        &self,
        run: &mut Run,
        selected: &[String],
        recorder: &mut RunRecorder,
        cancel: &CancellationToken,
    ) -> Result<Vec<CollectorOutcome>, PipelineError> {
        for name in selected {
            recorder.node_started(name, None).await;
        }
        let ctx = CollectContext {
            run_id: run.run_id,
            entity: run.entity.clone(),
            directive: run.directive,
        };
        let mut pending = self.pool.spawn(selected, &ctx);
        let mut outcomes = Vec::with_capacity(pending.len());

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                next = pending.next() => next,
            };
            let Some(outcome) = next else { break };

            for envelope in &outcome.output.provenance {
                let call = ToolCall::from_envelope(&outcome.collector, envelope);
                run.tool_calls.push(call.clone());
                recorder
                    .emit(&outcome.collector, EventDetail::ToolResult(call))
                    .await;
            }
            self.save_progress(run).await;

            match &outcome.error {
                None => {
                    recorder
                        .node_completed(
                            &outcome.collector,
                            format!(
                                "{} claims from {} sources in {}ms",
                                outcome.output.claims.len(),
                                outcome.output.provenance.len(),
                                outcome.elapsed.as_millis()
                            ),
                        )
                        .await;
                }
                Some(error) => {
                    tracing::warn!(collector = %outcome.collector, error = %error, "Collector failed");
                    recorder
                        .log(&outcome.collector, LogLevel::Warn, error.clone())
                        .await;
                    recorder.node_failed(&outcome.collector, error.clone()).await;
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn reevaluate(
        &self,
        run: &mut Run,
        record: &mut KnowledgeRecord,
        high: &[Delta],
        recorder: &mut RunRecorder,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        recorder
            .node_started(
                REEVALUATION_NODE,
                Some(format!("Re-evaluating due to {} HIGH changes", high.len())),
            )
            .await;

        let draft = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PipelineError::Cancelled),
            draft = self.reevaluator.reevaluate(record, high) => {
                draft.map_err(PipelineError::Reevaluation)?
            }
        };

        let now = Utc::now();
        let recommendations = draft.recommendations.len();
        record.evaluation = Some(Evaluation {
            run_id: run.run_id,
            generated_at: now,
            summary: draft.summary,
            recommendations: draft.recommendations,
        });
        record.pulse.insert(
            0,
            PulseEntry {
                timestamp: now,
                event: format!(
                    "Strategy re-evaluated due to {} significant change(s)",
                    high.len()
                ),
                impact: Impact::Positive,
                source_id: None,
            },
        );
        record.pulse.truncate(self.config.merge.max_pulse_entries);

        run.reevaluation = Some(ReevaluationOutcome::Completed {
            high_deltas: high.len(),
        });
        recorder
            .node_completed(
                REEVALUATION_NODE,
                format!("{recommendations} recommendations updated"),
            )
            .await;
        Ok(())
    }

    /// Client-facing projection of the latest completed run's record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entity has no record.
    pub async fn latest_result(&self, entity: &str) -> Result<AnalysisView, PipelineError> {
        Ok(self.knowledge_base(entity).await?.projection())
    }

    /// The full record, including confidence and provenance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entity has no record.
    pub async fn knowledge_base(&self, entity: &str) -> Result<KnowledgeRecord, PipelineError> {
        let entity = validate_entity(entity)?;
        self.store
            .load_record(&entity)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("knowledge base for {entity}")))
    }

    /// Material deltas across runs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn change_log(&self, entity: &str) -> Result<Vec<ChangeLogEntry>, PipelineError> {
        let entity = validate_entity(entity)?;
        Ok(self.store.change_log(&entity).await?)
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn list_runs(
        &self,
        entity: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, PipelineError> {
        Ok(self.store.list_runs(entity, limit).await?)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the run does not exist.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, PipelineError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("run {run_id}")))
    }

    /// Recorded events of a run with `seq > after_seq`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the run does not exist.
    pub async fn run_events(
        &self,
        run_id: Uuid,
        after_seq: u64,
    ) -> Result<Vec<PipelineEvent>, PipelineError> {
        let events = self.store.events_for_run(run_id, after_seq).await?;
        if events.is_empty() && self.store.get_run(run_id).await?.is_none() {
            return Err(PipelineError::NotFound(format!("run {run_id}")));
        }
        Ok(events)
    }

    /// Delete an entity's record and run history. A no-op for unknown entities.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` while a run is active for the entity.
    pub async fn clear_cache(&self, entity: &str) -> Result<bool, PipelineError> {
        let entity = validate_entity(entity)?;
        let _guard = self
            .locks
            .try_acquire(&entity)
            .map_err(|active| PipelineError::Conflict {
                entity: entity.clone(),
                run_id: active.run_id,
            })?;
        let removed = self.store.clear_entity(&entity).await?;
        tracing::info!(entity = %entity, removed, "Cache cleared");
        Ok(removed)
    }

    /// Generate a one-off dossier using the current record as context only.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record, `InvalidInput` for an empty
    /// topic, and `Dossier` if generation fails.
    pub async fn generate_dossier(&self, entity: &str, topic: &str) -> Result<Dossier, PipelineError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PipelineError::InvalidInput("topic is empty".to_string()));
        }
        let view = self.latest_result(entity).await?;
        tracing::info!(entity = %view.entity, topic, "Generating dossier");
        let dossier = self
            .dossiers
            .generate(&view, topic)
            .await
            .map_err(PipelineError::Dossier)?;
        Ok(dossier.normalized(&view.entity))
    }

    /// Every known entity with its run state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn list_entities(&self) -> Result<Vec<EntityStatus>, PipelineError> {
        let mut entities = self.store.list_entities().await?;
        for status in &mut entities {
            status.running = self.locks.is_locked(&status.entity);
        }
        Ok(entities)
    }
}
