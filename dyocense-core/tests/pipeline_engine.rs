// dyocense-core/tests/pipeline_engine.rs
// ============================================================================
// Module: Pipeline Engine Integration Tests
// Description: Drives PipelineEngine through its branching DAG outcomes:
//              happy path, policy denial, infeasible-then-diagnose,
//              timeout-partial, stage failure, and cancellation.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    missing_docs,
    reason = "Integration test fixtures use explicit unwraps/asserts for clarity."
)]

use std::sync::Arc;

use dyocense_core::clock::FixedClock;
use dyocense_core::engine::NoopSleeper;
use dyocense_core::engine::PipelineEngine;
use dyocense_core::engine::StageAdapters;
use dyocense_core::identifiers::IdempotencyKey;
use dyocense_core::identifiers::RunId;
use dyocense_core::identifiers::StageName;
use dyocense_core::identifiers::TenantId;
use dyocense_core::interfaces::AdapterError;
use dyocense_core::model::Run;
use dyocense_core::model::RunState;
use dyocense_core::model::StageState;
use dyocense_core::model::Tier;
use dyocense_core::registry::RunRegistry;
use dyocense_core::testkit::EchoAdapter;
use dyocense_core::testkit::FailingAdapter;
use dyocense_core::testkit::InMemoryEvidenceStore;
use dyocense_core::testkit::InMemoryRunRegistry;
use serde_json::json;
use serde_json::Value;

fn adapters(policy: Value, optimise: Value) -> StageAdapters {
    StageAdapters {
        compiler: Arc::new(EchoAdapter::new("compiler-v1", json!({}))),
        forecaster: Arc::new(EchoAdapter::new("forecaster-v1", json!({}))),
        policy: Arc::new(EchoAdapter::new("policy-v1", policy)),
        optimiser: Arc::new(EchoAdapter::new("optimiser-v1", optimise)),
        diagnostician: Arc::new(EchoAdapter::new("diagnostician-v1", json!({"relaxations": []}))),
        explainer: Arc::new(EchoAdapter::new("explainer-v1", json!({"narrative": "ok"}))),
    }
}

fn seeded_run(registry: &InMemoryRunRegistry, run_id: &str) -> RunId {
    let run = Run::new(
        RunId::new(run_id),
        TenantId::new("tenant-a"),
        Tier::Standard,
        "reduce holding cost".to_string(),
        7,
        IdempotencyKey::new("key"),
        0,
    );
    let id = run.run_id.clone();
    registry.create_run(run).expect("create succeeds");
    id
}

fn drive(adapters: StageAdapters, run_id: &RunId, registry: Arc<InMemoryRunRegistry>) -> RunState {
    let clock = Arc::new(FixedClock::at(0));
    let evidence = Arc::new(InMemoryEvidenceStore::new());
    let engine = PipelineEngine::new(adapters, registry, evidence, clock, Arc::new(NoopSleeper));
    engine.drive(run_id).expect("drive succeeds")
}

#[test]
fn happy_path_reaches_succeeded_with_diagnose_skipped() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-happy");
    let state = drive(adapters(json!({"allow": true}), json!({"status": "optimal"})), &run_id, registry.clone());
    assert_eq!(state, RunState::Succeeded);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Diagnose).expect("stage present").state, StageState::Skipped);
    assert_eq!(run.stage(StageName::Optimise).expect("stage present").state, StageState::Succeeded);
    assert_eq!(run.stage(StageName::Evidence).expect("stage present").state, StageState::Succeeded);
    assert!(run.fingerprints.model_fingerprint.is_some());
    assert!(run.fingerprints.plan_dna.is_some());
    assert!(run.fingerprints.evidence_ref.is_some());
    assert!(run.fingerprints.snapshot_hash.is_some());
}

#[test]
fn policy_denial_short_circuits_optimise_and_diagnose() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-denied");
    let state = drive(adapters(json!({"allow": false}), json!({"status": "optimal"})), &run_id, registry.clone());
    assert_eq!(state, RunState::Denied);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Optimise).expect("stage present").state, StageState::Skipped);
    assert_eq!(run.stage(StageName::Diagnose).expect("stage present").state, StageState::Skipped);
    assert_eq!(run.stage(StageName::Explain).expect("stage present").state, StageState::Succeeded);
}

#[test]
fn infeasible_solution_runs_diagnose_and_still_succeeds() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-infeasible");
    let state = drive(adapters(json!({"allow": true}), json!({"status": "infeasible"})), &run_id, registry.clone());
    assert_eq!(state, RunState::Succeeded);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Diagnose).expect("stage present").state, StageState::Succeeded);
}

#[test]
fn timeout_partial_solution_yields_succeeded_partial() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-partial");
    let state =
        drive(adapters(json!({"allow": true}), json!({"status": "timeout_partial"})), &run_id, registry.clone());
    assert_eq!(state, RunState::SucceededPartial);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Diagnose).expect("stage present").state, StageState::Skipped);
}

#[test]
fn a_non_retryable_stage_failure_fails_the_run_and_skips_downstream_stages() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-failed");
    let mut stage_adapters = adapters(json!({"allow": true}), json!({"status": "optimal"}));
    stage_adapters.compiler = Arc::new(FailingAdapter::new(|| AdapterError::Logic("bad goal".to_string())));

    let state = drive(stage_adapters, &run_id, registry.clone());
    assert_eq!(state, RunState::Failed);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Compile).expect("stage present").state, StageState::Failed);
    assert_eq!(run.stage(StageName::Forecast).expect("stage present").state, StageState::Pending);
}

#[test]
fn a_policy_adapter_failure_fails_the_run_rather_than_treating_it_as_a_denial() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-policy-failed");
    let mut stage_adapters = adapters(json!({"allow": true}), json!({"status": "optimal"}));
    stage_adapters.policy = Arc::new(FailingAdapter::new(|| AdapterError::Logic("policy engine crashed".to_string())));

    let state = drive(stage_adapters, &run_id, registry.clone());
    assert_eq!(state, RunState::Failed);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Policy).expect("stage present").state, StageState::Failed);
    assert_eq!(run.stage(StageName::Optimise).expect("stage present").state, StageState::Pending);
}

#[test]
fn a_cancellation_requested_before_driving_short_circuits_every_stage() {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let run_id = seeded_run(&registry, "run-canceled");
    registry.cancel(&run_id, 0).expect("cancel succeeds");

    let state = drive(adapters(json!({"allow": true}), json!({"status": "optimal"})), &run_id, registry.clone());
    assert_eq!(state, RunState::Canceled);

    let run = registry.get_run(&run_id).expect("get succeeds").expect("run present");
    assert_eq!(run.stage(StageName::Compile).expect("stage present").state, StageState::Pending);
}
