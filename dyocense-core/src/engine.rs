// dyocense-core/src/engine.rs
// ============================================================================
// Module: Pipeline Engine
// Description: Deterministic stage-DAG driver with retry, timeout, and
//              partial-failure policy.
// Purpose: Drive a run's fixed stage DAG to a terminal state with full provenance.
// Dependencies: crate::{model, interfaces, registry, fingerprint, clock}
// ============================================================================

//! ## Overview
//! The engine is the single canonical execution path for a run: every stage
//! beyond bookkeeping is invoked through a [`crate::interfaces`] trait, and
//! every transition is persisted through the [`crate::registry::RunRegistry`].
//! Stages execute strictly left to right on the happy path; `Diagnose` is
//! entered only after an `Optimise` that reports `infeasible`, and its output
//! is advisory — there is no automatic re-solve.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::clock::Clock;
use crate::evidence::EdgeKind;
use crate::evidence::EvidenceEdge;
use crate::evidence::EvidenceGraph;
use crate::evidence::EvidenceNode;
use crate::evidence::EvidenceStore;
use crate::evidence::MAX_EVIDENCE_ATTEMPTS;
use crate::evidence::NodeKind;
use crate::evidence::write_with_retry;
use crate::fingerprint::DEFAULT_HASH_ALGORITHM;
use crate::fingerprint::DEFAULT_VOLATILE_FIELDS;
use crate::fingerprint::HashError;
use crate::fingerprint::PlanDnaInputs;
use crate::fingerprint::hash_canonical_json;
use crate::fingerprint::model_fingerprint;
use crate::fingerprint::plan_dna;
use crate::identifiers::EvidenceNodeId;
use crate::identifiers::RunId;
use crate::identifiers::StageName;
use crate::interfaces::AdapterError;
use crate::interfaces::AdapterOutput;
use crate::interfaces::Compiler;
use crate::interfaces::Diagnostician;
use crate::interfaces::Explainer;
use crate::interfaces::Forecaster;
use crate::interfaces::Optimiser;
use crate::interfaces::PolicyGuard;
use crate::model::ErrorKind;
use crate::model::Run;
use crate::model::RunState;
use crate::model::StageState;
use crate::registry::RegistryError;
use crate::registry::RunRegistry;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Boundary error the engine returns when a run cannot be driven further.
/// These are infrastructure failures around the engine itself; a stage's own
/// failure is recorded on its [`crate::model::StageRecord`] and does not
/// necessarily surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run does not exist in the registry.
    #[error("run {0} not found")]
    RunNotFound(RunId),
    /// The registry reported an error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Fingerprinting a stage's canonical input or output failed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

// ============================================================================
// SECTION: Retry / Timeout Policy
// ============================================================================

/// Maximum attempts for a stage whose failure kind is retryable.
pub const MAX_STAGE_ATTEMPTS: u32 = 3;

/// Backoff base delay, per the retry policy (250ms, cap 4s, ±20% jitter).
const BACKOFF_BASE_MS: u64 = 250;
/// Backoff cap delay.
const BACKOFF_CAP_MS: u64 = 4_000;

/// Computes the backoff delay for a given attempt (1-indexed), with jitter.
fn backoff_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(8));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter_ratio = rng.gen_range(0.8..=1.2);
    #[allow(clippy::cast_possible_truncation, reason = "capped delay is well within u64 range")]
    let millis = ((capped as f64) * jitter_ratio) as u64;
    Duration::from_millis(millis)
}

/// Injectable sleep strategy so tests never actually block on backoff delays.
pub trait BackoffSleeper: Send + Sync {
    /// Sleeps for (approximately) `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the real wall clock via [`std::thread::sleep`].
#[derive(Debug, Default)]
pub struct RealSleeper;

impl BackoffSleeper for RealSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Never actually sleeps; used by tests to keep retry-heavy suites fast.
#[derive(Debug, Default)]
pub struct NoopSleeper;

impl BackoffSleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) {}
}

/// Runs `invoke` on a dedicated thread and abandons it if it does not
/// complete within `timeout`. Abandoning rather than joining mirrors the
/// concurrency model's cancellation rule: a stage that will not yield is
/// walked away from, not waited on indefinitely.
fn invoke_with_timeout<F>(invoke: F, timeout: Duration) -> Result<AdapterOutput, AdapterError>
where
    F: FnOnce() -> Result<AdapterOutput, AdapterError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = invoke();
        let _ = tx.send(result);
    });
    rx.recv_timeout(timeout).unwrap_or(Err(AdapterError::TimedOut))
}

// ============================================================================
// SECTION: Stage Adapter Registry
// ============================================================================

/// Bundles the six pluggable stage capabilities the engine invokes.
pub struct StageAdapters {
    /// Compile stage capability.
    pub compiler: Arc<dyn Compiler>,
    /// Forecast stage capability.
    pub forecaster: Arc<dyn Forecaster>,
    /// Policy stage capability.
    pub policy: Arc<dyn PolicyGuard>,
    /// Optimise stage capability.
    pub optimiser: Arc<dyn Optimiser>,
    /// Diagnose stage capability.
    pub diagnostician: Arc<dyn Diagnostician>,
    /// Explain stage capability.
    pub explainer: Arc<dyn Explainer>,
}

// ============================================================================
// SECTION: Stage Outcome
// ============================================================================

/// What `drive_stage` decided for a single stage, including how the overall
/// run should react.
struct StageOutcome {
    state: StageState,
    error_kind: Option<ErrorKind>,
    error_msg: Option<String>,
    output: Option<Value>,
}

/// Cache key for the in-pipeline idempotence check: identical canonical
/// input, for the same run and stage, reuses the prior output without
/// invoking the adapter again.
type OutputCacheKey = (RunId, StageName, String);

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Drives a single run's fixed stage DAG to completion.
pub struct PipelineEngine {
    adapters: StageAdapters,
    registry: Arc<dyn RunRegistry>,
    evidence: Arc<dyn EvidenceStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn BackoffSleeper>,
    output_cache: Mutex<HashMap<OutputCacheKey, Value>>,
}

impl PipelineEngine {
    /// Builds an engine from its adapters, registry, evidence store, clock,
    /// and backoff sleeper.
    #[must_use]
    pub fn new(
        adapters: StageAdapters,
        registry: Arc<dyn RunRegistry>,
        evidence: Arc<dyn EvidenceStore>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn BackoffSleeper>,
    ) -> Self {
        Self { adapters, registry, evidence, clock, sleeper, output_cache: Mutex::new(HashMap::new()) }
    }

    /// Drives `run_id` from `admitted` through to a terminal state, honoring
    /// cooperative cancellation checks before each stage.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the run cannot be loaded or the registry
    /// rejects a write; individual stage failures are recorded on the run
    /// instead of being returned here.
    pub fn drive(&self, run_id: &RunId) -> Result<RunState, EngineError> {
        let mut run = self.registry.get_run(run_id)?.ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;

        self.registry.set_run_state(run_id, RunState::Running, self.clock.now_unix_millis())?;
        run.state = RunState::Running;

        let mut solution_status: Option<String> = None;

        for stage in [
            StageName::Compile,
            StageName::Forecast,
            StageName::Policy,
            StageName::Optimise,
        ] {
            if self.cancel_if_requested(&mut run, run_id)? {
                return Ok(run.state);
            }

            let outcome = self.drive_stage(&mut run, stage)?;
            self.apply_outcome(&mut run, run_id, stage, &outcome)?;

            match stage {
                StageName::Policy => {
                    if outcome.state == StageState::Failed || outcome.state == StageState::TimedOut {
                        self.fail_run(&mut run, run_id)?;
                        return Ok(run.state);
                    }
                    if let Some(Value::Object(map)) = &outcome.output {
                        let allowed = map.get("allow").and_then(Value::as_bool).unwrap_or(true);
                        if !allowed {
                            self.mark_skipped(&mut run, run_id, StageName::Optimise)?;
                            self.mark_skipped(&mut run, run_id, StageName::Diagnose)?;
                            self.finish_denial(&mut run, run_id)?;
                            return Ok(run.state);
                        }
                    }
                }
                StageName::Optimise => {
                    if outcome.state != StageState::Succeeded && outcome.state != StageState::TimedOut {
                        self.fail_run(&mut run, run_id)?;
                        return Ok(run.state);
                    }
                    solution_status = outcome
                        .output
                        .as_ref()
                        .and_then(|value| value.get("status"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                _ => {
                    if outcome.state == StageState::Failed || outcome.state == StageState::TimedOut {
                        self.fail_run(&mut run, run_id)?;
                        return Ok(run.state);
                    }
                }
            }
        }

        if solution_status.as_deref() == Some("infeasible") {
            if self.cancel_if_requested(&mut run, run_id)? {
                return Ok(run.state);
            }
            let outcome = self.drive_stage(&mut run, StageName::Diagnose)?;
            self.apply_outcome(&mut run, run_id, StageName::Diagnose, &outcome)?;
        } else {
            self.mark_skipped(&mut run, run_id, StageName::Diagnose)?;
        }

        if self.cancel_if_requested(&mut run, run_id)? {
            return Ok(run.state);
        }
        let explain_outcome = self.drive_stage(&mut run, StageName::Explain)?;
        self.apply_outcome(&mut run, run_id, StageName::Explain, &explain_outcome)?;

        if self.cancel_if_requested(&mut run, run_id)? {
            return Ok(run.state);
        }
        self.finalize_fingerprints(&mut run, run_id)?;
        self.drive_evidence_stage(&mut run, run_id)?;

        let terminal = if solution_status.as_deref() == Some("timeout_partial") {
            RunState::SucceededPartial
        } else {
            RunState::Succeeded
        };
        let now = self.clock.now_unix_millis();
        self.registry.set_run_state(run_id, terminal, now)?;
        run.state = terminal;
        Ok(run.state)
    }

    fn cancel_if_requested(&self, run: &mut Run, run_id: &RunId) -> Result<bool, EngineError> {
        if self.registry.is_cancellation_requested(run_id)? {
            let now = self.clock.now_unix_millis();
            self.registry.set_run_state(run_id, RunState::Canceled, now)?;
            run.state = RunState::Canceled;
            return Ok(true);
        }
        Ok(false)
    }

    fn mark_skipped(&self, run: &mut Run, run_id: &RunId, stage: StageName) -> Result<(), EngineError> {
        if let Some(record) = run.stage_mut(stage) {
            record.state = StageState::Skipped;
            let updated = record.clone();
            self.registry.update_stage(run_id, updated)?;
        }
        Ok(())
    }

    fn finish_denial(&self, run: &mut Run, run_id: &RunId) -> Result<(), EngineError> {
        self.cancel_if_requested(run, run_id)?;
        let explain_outcome = self.drive_stage(run, StageName::Explain)?;
        self.apply_outcome(run, run_id, StageName::Explain, &explain_outcome)?;
        self.finalize_fingerprints(run, run_id)?;
        self.drive_evidence_stage(run, run_id)?;
        let now = self.clock.now_unix_millis();
        self.registry.set_run_state(run_id, RunState::Denied, now)?;
        run.state = RunState::Denied;
        Ok(())
    }

    fn fail_run(&self, run: &mut Run, run_id: &RunId) -> Result<(), EngineError> {
        let now = self.clock.now_unix_millis();
        self.registry.set_run_state(run_id, RunState::Failed, now)?;
        run.state = RunState::Failed;
        Ok(())
    }

    fn apply_outcome(
        &self,
        run: &mut Run,
        run_id: &RunId,
        stage: StageName,
        outcome: &StageOutcome,
    ) -> Result<(), EngineError> {
        let now = self.clock.now_unix_millis();
        if let Some(record) = run.stage_mut(stage) {
            record.state = outcome.state;
            record.ended_at = Some(now);
            record.error_kind = outcome.error_kind;
            record.error_msg.clone_from(&outcome.error_msg);
            if let Some(value) = &outcome.output {
                record.fingerprint = model_fingerprint(value, DEFAULT_VOLATILE_FIELDS).ok();
            }
            let updated = record.clone();
            self.registry.update_stage(run_id, updated)?;
        }
        Ok(())
    }

    /// Drives a single stage through its retry policy and records attempt
    /// bookkeeping, without persisting the outcome (the caller persists it).
    fn drive_stage(&self, run: &mut Run, stage: StageName) -> Result<StageOutcome, EngineError> {
        let input = self.build_input(run, stage);
        let input_fingerprint = model_fingerprint(&input, DEFAULT_VOLATILE_FIELDS)?;
        let cache_key = (run.run_id.clone(), stage, input_fingerprint.value.clone());

        if let Some(cached) = self.output_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&cache_key) {
            return Ok(StageOutcome {
                state: StageState::Succeeded,
                error_kind: None,
                error_msg: None,
                output: Some(cached.clone()),
            });
        }

        let timeout_ms = run.tier_snapshot_timeout(stage);
        let mut rng = rand::thread_rng();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(record) = run.stage_mut(stage) {
                record.attempts = attempts;
                record.state = StageState::Running;
                record.started_at.get_or_insert(self.clock.now_unix_millis());
            }

            let result = self.invoke_adapter(stage, &input, run.seed, timeout_ms);

            match result {
                Ok(output) => {
                    self.output_cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(cache_key, output.value.clone());
                    return Ok(StageOutcome {
                        state: StageState::Succeeded,
                        error_kind: None,
                        error_msg: None,
                        output: Some(output.value),
                    });
                }
                Err(AdapterError::TimedOut) => {
                    return Ok(StageOutcome {
                        state: StageState::TimedOut,
                        error_kind: Some(ErrorKind::TimedOut),
                        error_msg: Some("stage exceeded its wall-clock timeout".to_string()),
                        output: None,
                    });
                }
                Err(AdapterError::Unavailable(_)) if attempts < MAX_STAGE_ATTEMPTS => {
                    self.sleeper.sleep(backoff_delay(attempts, &mut rng));
                }
                Err(AdapterError::Unavailable(msg)) => {
                    return Ok(StageOutcome {
                        state: StageState::Failed,
                        error_kind: Some(ErrorKind::AdapterUnavailable),
                        error_msg: Some(redact(&msg)),
                        output: None,
                    });
                }
                Err(AdapterError::InvalidInput(msg)) => {
                    return Ok(StageOutcome {
                        state: StageState::Failed,
                        error_kind: Some(ErrorKind::Validation),
                        error_msg: Some(redact(&msg)),
                        output: None,
                    });
                }
                Err(AdapterError::Logic(msg)) => {
                    return Ok(StageOutcome {
                        state: StageState::Failed,
                        error_kind: Some(stage_logic_error_kind(stage)),
                        error_msg: Some(redact(&msg)),
                        output: None,
                    });
                }
            }
        }
    }

    fn invoke_adapter(
        &self,
        stage: StageName,
        input: &Value,
        seed: u64,
        timeout_ms: u64,
    ) -> Result<AdapterOutput, AdapterError> {
        let timeout = Duration::from_millis(timeout_ms);
        let input = input.clone();
        match stage {
            StageName::Compile => {
                let adapter = Arc::clone(&self.adapters.compiler);
                invoke_with_timeout(move || adapter.compile(&input, seed), timeout)
            }
            StageName::Forecast => {
                let adapter = Arc::clone(&self.adapters.forecaster);
                invoke_with_timeout(move || adapter.forecast(&input, seed), timeout)
            }
            StageName::Policy => {
                let adapter = Arc::clone(&self.adapters.policy);
                invoke_with_timeout(move || adapter.evaluate(&input, seed), timeout)
            }
            StageName::Optimise => {
                let adapter = Arc::clone(&self.adapters.optimiser);
                invoke_with_timeout(move || adapter.optimise(&input, seed), timeout)
            }
            StageName::Diagnose => {
                let adapter = Arc::clone(&self.adapters.diagnostician);
                invoke_with_timeout(move || adapter.diagnose(&input, seed), timeout)
            }
            StageName::Explain => {
                let adapter = Arc::clone(&self.adapters.explainer);
                invoke_with_timeout(move || adapter.explain(&input, seed), timeout)
            }
            StageName::Evidence => Err(AdapterError::Logic(
                "evidence is written by drive_evidence_stage, not a stage adapter".to_string(),
            )),
        }
    }

    /// Returns the already-completed, cached output of `stage` for this run,
    /// falling back to its bare fingerprint if the full output fell out of
    /// cache, or `Value::Null` if the stage never succeeded.
    fn cached_output(&self, run: &Run, stage: StageName) -> Value {
        let cache = self.output_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        run.stages
            .iter()
            .find(|record| record.name == stage && record.state == StageState::Succeeded)
            .and_then(|record| record.fingerprint.as_ref())
            .map(|fingerprint| {
                cache
                    .iter()
                    .find(|((rid, sname, _), _)| rid == &run.run_id && *sname == stage)
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| Value::String(fingerprint.value.clone()))
            })
            .unwrap_or(Value::Null)
    }

    /// Builds the canonical input envelope for a stage from the run and its
    /// already-completed prior stage outputs.
    fn build_input(&self, run: &Run, stage: StageName) -> Value {
        let prior = |name: StageName| -> Value { self.cached_output(run, name) };

        match stage {
            StageName::Compile => serde_json::json!({
                "goal_text": run.goal,
                "tenant_ctx": { "tenant_id": run.tenant_id.as_str(), "tier": run.tier_snapshot },
            }),
            StageName::Forecast => serde_json::json!({ "ops": prior(StageName::Compile), "seed": run.seed }),
            StageName::Policy => serde_json::json!({
                "ops": prior(StageName::Compile),
                "tenant_ctx": { "tenant_id": run.tenant_id.as_str() },
            }),
            StageName::Optimise => serde_json::json!({
                "ops": prior(StageName::Compile),
                "scenarios": prior(StageName::Forecast),
                "seed": run.seed,
            }),
            StageName::Diagnose => serde_json::json!({
                "ops": prior(StageName::Compile),
                "partial_solution": prior(StageName::Optimise),
            }),
            StageName::Explain => serde_json::json!({
                "ops": prior(StageName::Compile),
                "pack": prior(StageName::Optimise),
                "forecasts": prior(StageName::Forecast),
                "policy": prior(StageName::Policy),
                "diagnostics": prior(StageName::Diagnose),
            }),
            StageName::Evidence => Value::Null,
        }
    }

    /// Builds this run's evidence graph from its accumulated stage outputs.
    /// Every edge points from the later artifact to the earlier artifact it
    /// derives from, constrains, optimizes, or is measured by.
    fn build_evidence_graph(&self, run: &Run) -> EvidenceGraph {
        let succeeded = |stage: StageName| {
            run.stage(stage).is_some_and(|record| record.state == StageState::Succeeded)
        };

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        let goal_id = EvidenceNodeId::new(format!("{}:goal", run.run_id));
        nodes.push(EvidenceNode {
            run_id: run.run_id.clone(),
            node_id: goal_id.clone(),
            kind: NodeKind::Goal,
            content_ref: None,
            attributes: Value::String(run.goal.clone()),
        });

        if succeeded(StageName::Policy) {
            let constraint_id = EvidenceNodeId::new(format!("{}:constraint", run.run_id));
            nodes.push(EvidenceNode {
                run_id: run.run_id.clone(),
                node_id: constraint_id.clone(),
                kind: NodeKind::Constraint,
                content_ref: None,
                attributes: self.cached_output(run, StageName::Policy),
            });
            edges.push(EvidenceEdge {
                run_id: run.run_id.clone(),
                from: constraint_id,
                to: goal_id.clone(),
                kind: EdgeKind::Constrains,
            });
        }

        if succeeded(StageName::Forecast) {
            let scenario_id = EvidenceNodeId::new(format!("{}:scenario", run.run_id));
            nodes.push(EvidenceNode {
                run_id: run.run_id.clone(),
                node_id: scenario_id.clone(),
                kind: NodeKind::Scenario,
                content_ref: None,
                attributes: self.cached_output(run, StageName::Forecast),
            });
            edges.push(EvidenceEdge {
                run_id: run.run_id.clone(),
                from: scenario_id,
                to: goal_id.clone(),
                kind: EdgeKind::DerivedFrom,
            });
        }

        if succeeded(StageName::Optimise) {
            let solver_id = EvidenceNodeId::new(format!("{}:solver_run", run.run_id));
            nodes.push(EvidenceNode {
                run_id: run.run_id.clone(),
                node_id: solver_id.clone(),
                kind: NodeKind::SolverRun,
                content_ref: None,
                attributes: self.cached_output(run, StageName::Optimise),
            });
            edges.push(EvidenceEdge {
                run_id: run.run_id.clone(),
                from: solver_id.clone(),
                to: goal_id.clone(),
                kind: EdgeKind::Optimizes,
            });

            let plan_attributes = if succeeded(StageName::Explain) {
                self.cached_output(run, StageName::Explain)
            } else {
                self.cached_output(run, StageName::Optimise)
            };
            let plan_id = EvidenceNodeId::new(format!("{}:plan", run.run_id));
            nodes.push(EvidenceNode {
                run_id: run.run_id.clone(),
                node_id: plan_id.clone(),
                kind: NodeKind::Plan,
                content_ref: None,
                attributes: plan_attributes,
            });
            edges.push(EvidenceEdge {
                run_id: run.run_id.clone(),
                from: plan_id.clone(),
                to: solver_id,
                kind: EdgeKind::DerivedFrom,
            });

            if succeeded(StageName::Explain) {
                let kpi_id = EvidenceNodeId::new(format!("{}:kpi", run.run_id));
                nodes.push(EvidenceNode {
                    run_id: run.run_id.clone(),
                    node_id: kpi_id.clone(),
                    kind: NodeKind::Kpi,
                    content_ref: None,
                    attributes: self.cached_output(run, StageName::Explain),
                });
                edges.push(EvidenceEdge {
                    run_id: run.run_id.clone(),
                    from: kpi_id,
                    to: plan_id,
                    kind: EdgeKind::MeasuredBy,
                });
            }
        }

        EvidenceGraph { nodes, edges }
    }

    /// Computes and persists the run's `model_fingerprint` and, once a solve
    /// has run, its `plan_dna`, reusing the per-stage fingerprints already
    /// recorded by `apply_outcome`.
    fn finalize_fingerprints(&self, run: &mut Run, run_id: &RunId) -> Result<(), EngineError> {
        let model_fp = run.stage(StageName::Compile).and_then(|record| record.fingerprint.clone());

        let optimise_done = run
            .stage(StageName::Optimise)
            .is_some_and(|record| record.state == StageState::Succeeded || record.state == StageState::TimedOut);

        let plan_fp = match (
            run.stage(StageName::Compile).and_then(|record| record.fingerprint.as_ref()),
            run.stage(StageName::Forecast).and_then(|record| record.fingerprint.as_ref()),
        ) {
            (Some(ops_fp), Some(scenarios_fp)) if optimise_done => {
                let policy_snapshot = self.cached_output(run, StageName::Policy);
                let solution_decisions = self.cached_output(run, StageName::Optimise);
                let inputs = PlanDnaInputs {
                    ops_fingerprint: &ops_fp.value,
                    scenarios_fingerprint: &scenarios_fp.value,
                    policy_snapshot: &policy_snapshot,
                    solution_decisions: &solution_decisions,
                };
                Some(plan_dna(&inputs)?)
            }
            _ => None,
        };

        if model_fp.is_some() || plan_fp.is_some() {
            self.registry.append_fingerprint(run_id, model_fp.clone(), plan_fp.clone(), None, None)?;
            if let Some(fingerprint) = model_fp {
                run.fingerprints.model_fingerprint = Some(fingerprint);
            }
            if let Some(fingerprint) = plan_fp {
                run.fingerprints.plan_dna = Some(fingerprint);
            }
        }
        Ok(())
    }

    /// Writes this run's evidence graph with retry, marking the `evidence`
    /// stage `succeeded` or `failed` on its own record without demoting the
    /// run's own terminal state (per the evidence write-retry policy).
    fn drive_evidence_stage(&self, run: &mut Run, run_id: &RunId) -> Result<(), EngineError> {
        if let Some(record) = run.stage_mut(StageName::Evidence) {
            record.state = StageState::Running;
            record.started_at.get_or_insert(self.clock.now_unix_millis());
        }

        let graph = self.build_evidence_graph(run);
        let sleeper = Arc::clone(&self.sleeper);
        let mut last_attempt = 0u32;
        let result = write_with_retry(self.evidence.as_ref(), &graph, |attempt| {
            last_attempt = attempt;
            sleeper.sleep(backoff_delay(attempt, &mut rand::thread_rng()));
        });

        let now = self.clock.now_unix_millis();
        if let Some(record) = run.stage_mut(StageName::Evidence) {
            record.ended_at = Some(now);
            record.attempts = if result.is_ok() { last_attempt + 1 } else { MAX_EVIDENCE_ATTEMPTS };
            match &result {
                Ok(_) => {
                    record.state = StageState::Succeeded;
                    record.error_kind = None;
                    record.error_msg = None;
                }
                Err(err) => {
                    record.state = StageState::Failed;
                    record.error_kind = Some(ErrorKind::AdapterUnavailable);
                    record.error_msg = Some(redact(&err.to_string()));
                }
            }
            let updated = record.clone();
            self.registry.update_stage(run_id, updated)?;
        }

        if let Ok(content_ref) = &result {
            let snapshot_hash = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &graph)?;
            self.registry.append_fingerprint(
                run_id,
                None,
                None,
                Some(content_ref.clone()),
                Some(snapshot_hash.clone()),
            )?;
            run.fingerprints.evidence_ref = Some(content_ref.clone());
            run.fingerprints.snapshot_hash = Some(snapshot_hash);
        }

        Ok(())
    }
}

/// Extension resolving a run's stage timeout from its tier snapshot. Kept as
/// a free trait here rather than threading a caps resolver through every
/// call; a host wiring real tiers supplies the mapping via
/// `dyocense-config`.
trait TierTimeout {
    fn tier_snapshot_timeout(&self, stage: StageName) -> u64;
}

impl TierTimeout for Run {
    fn tier_snapshot_timeout(&self, stage: StageName) -> u64 {
        let base = match self.tier_snapshot {
            crate::model::Tier::Free => 5_000,
            crate::model::Tier::Standard => 10_000,
            crate::model::Tier::Pro => 20_000,
            crate::model::Tier::Enterprise => 30_000,
        };
        match stage {
            StageName::Optimise => base * 3,
            StageName::Forecast => base * 2,
            _ => base,
        }
    }
}

/// Classifies a non-retryable logic error raised by a given stage's adapter
/// into the caller-visible taxonomy.
const fn stage_logic_error_kind(stage: StageName) -> ErrorKind {
    match stage {
        StageName::Optimise => ErrorKind::SolverError,
        StageName::Forecast => ErrorKind::ForecastError,
        StageName::Explain => ErrorKind::ExplainError,
        StageName::Policy => ErrorKind::PolicyEvalError,
        _ => ErrorKind::Validation,
    }
}

/// Redacts an adapter error message to the first 200 characters so stage
/// records never carry unbounded or sensitive adapter output.
fn redact(message: &str) -> String {
    if message.len() <= 200 {
        message.to_string()
    } else {
        let boundary = (0..=200).rfind(|&i| message.is_char_boundary(i)).unwrap_or(0);
        format!("{}…", &message[..boundary])
    }
}
