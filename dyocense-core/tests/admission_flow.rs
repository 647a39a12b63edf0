// dyocense-core/tests/admission_flow.rs
// ============================================================================
// Module: Admission Flow Integration Tests
// Description: Exercises AdmissionController end to end against the in-memory
//              fakes: idempotent replay, tier-limit rejection, budget
//              exhaustion, and seed determinism.
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

use dyocense_core::BudgetAccountant;
use dyocense_core::admission::AdmissionController;
use dyocense_core::admission::AdmissionError;
use dyocense_core::admission::SubmitRequest;
use dyocense_core::clock::FixedClock;
use dyocense_core::clock::derive_seed;
use dyocense_core::identifiers::IdempotencyKey;
use dyocense_core::identifiers::TenantId;
use dyocense_core::model::BudgetVector;
use dyocense_core::model::StageTimeouts;
use dyocense_core::model::TenantCaps;
use dyocense_core::model::TenantProfile;
use dyocense_core::model::Tier;
use dyocense_core::registry::RunFilter;
use dyocense_core::registry::RunRegistry;
use dyocense_core::scheduler::WfqScheduler;
use dyocense_core::testkit::InMemoryBudgetAccountant;
use dyocense_core::testkit::InMemoryIdempotencyIndex;
use dyocense_core::testkit::InMemoryRunRegistry;
use dyocense_core::testkit::StaticTenantResolver;

fn generous_timeouts() -> StageTimeouts {
    StageTimeouts {
        compile_ms: 5_000,
        forecast_ms: 10_000,
        policy_ms: 2_000,
        optimise_ms: 30_000,
        diagnose_ms: 5_000,
        explain_ms: 5_000,
        evidence_ms: 5_000,
    }
}

fn profile(max_scenarios: u32, max_horizon: u32, budget: BudgetVector) -> TenantProfile {
    TenantProfile {
        tier: Tier::Standard,
        weight: 1.0,
        caps: TenantCaps {
            max_parallel_runs: 4,
            max_scenarios,
            max_horizon,
            stage_timeouts: generous_timeouts(),
            mip_gap_floor: 0.01,
            budget,
        },
    }
}

struct Harness {
    controller: AdmissionController,
    registry: Arc<InMemoryRunRegistry>,
    budget: Arc<InMemoryBudgetAccountant>,
}

fn harness(tenant_id: &str, tenant_profile: TenantProfile) -> Harness {
    let resolver = Arc::new(StaticTenantResolver::new());
    resolver.register(tenant_id, tenant_profile);
    let idempotency = Arc::new(InMemoryIdempotencyIndex::new());
    let budget = Arc::new(InMemoryBudgetAccountant::new());
    budget.set_cap(TenantId::new(tenant_id), tenant_profile.caps.budget);
    let registry = Arc::new(InMemoryRunRegistry::new());
    let scheduler = Arc::new(WfqScheduler::new(4));
    let clock = Arc::new(FixedClock::at(1_700_000_000_000));
    let controller = AdmissionController::new(
        resolver,
        idempotency,
        budget.clone(),
        registry.clone(),
        scheduler,
        clock,
    );
    Harness { controller, registry, budget }
}

fn request(tenant_id: &str, key: &str) -> SubmitRequest {
    SubmitRequest {
        tenant_id: TenantId::new(tenant_id),
        idempotency_key: IdempotencyKey::new(key),
        goal: "reduce holding cost next quarter".to_string(),
        horizon: 4,
        num_scenarios: 10,
    }
}

#[test]
fn resubmitting_the_same_idempotency_key_returns_the_original_run() {
    let generous = BudgetVector { solver_sec: 1_000.0, llm_tokens: 1_000.0, gpu_sec: 1_000.0 };
    let harness = harness("tenant-a", profile(100, 52, generous));

    let first = harness.controller.admit(&request("tenant-a", "key-1")).expect("first admit succeeds");
    assert!(first.duplicate_of.is_none());

    let second = harness.controller.admit(&request("tenant-a", "key-1")).expect("replay succeeds");
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.duplicate_of, Some(first.run_id.clone()));

    let all_runs = harness
        .registry
        .list_runs(&TenantId::new("tenant-a"), &RunFilter::default())
        .expect("list succeeds");
    assert_eq!(all_runs.len(), 1, "a replayed submission must never create a second run");
}

#[test]
fn admission_rejects_num_scenarios_above_the_tenant_tier_maximum() {
    let generous = BudgetVector { solver_sec: 1_000.0, llm_tokens: 1_000.0, gpu_sec: 1_000.0 };
    let harness = harness("tenant-b", profile(5, 52, generous));

    let mut req = request("tenant-b", "key-1");
    req.num_scenarios = 50;
    let result = harness.controller.admit(&req);
    assert!(matches!(result, Err(AdmissionError::TooManyScenarios { requested: 50, max: 5 })));

    let all_runs = harness
        .registry
        .list_runs(&TenantId::new("tenant-b"), &RunFilter::default())
        .expect("list succeeds");
    assert!(all_runs.is_empty(), "a rejected request must never create a run");
}

#[test]
fn admission_rejects_horizon_above_the_tenant_tier_maximum() {
    let generous = BudgetVector { solver_sec: 1_000.0, llm_tokens: 1_000.0, gpu_sec: 1_000.0 };
    let harness = harness("tenant-c", profile(100, 8, generous));

    let mut req = request("tenant-c", "key-1");
    req.horizon = 52;
    let result = harness.controller.admit(&req);
    assert!(matches!(result, Err(AdmissionError::HorizonTooLarge { requested: 52, max: 8 })));
}

#[test]
fn admission_rejects_when_the_reservation_would_exceed_budget() {
    let tiny = BudgetVector { solver_sec: 0.000_1, llm_tokens: 0.000_1, gpu_sec: 0.000_1 };
    let harness = harness("tenant-d", profile(100, 52, tiny));

    let result = harness.controller.admit(&request("tenant-d", "key-1"));
    assert!(matches!(result, Err(AdmissionError::BudgetExhausted(_))));

    let all_runs = harness
        .registry
        .list_runs(&TenantId::new("tenant-d"), &RunFilter::default())
        .expect("list succeeds");
    assert!(all_runs.is_empty(), "budget exhaustion must never create a run");

    let reports = harness.budget.query(&TenantId::new("tenant-d"), "2023-11").expect("query succeeds");
    assert!(reports.iter().all(|report| report.reserved == 0.0), "a rejected reservation leaves no trace");
}

#[test]
fn two_distinct_idempotency_keys_for_the_same_tenant_derive_distinct_seeds() {
    let generous = BudgetVector { solver_sec: 1_000.0, llm_tokens: 1_000.0, gpu_sec: 1_000.0 };
    let harness = harness("tenant-e", profile(100, 52, generous));

    let outcome_one = harness.controller.admit(&request("tenant-e", "key-1")).expect("admit succeeds");
    let outcome_two = harness.controller.admit(&request("tenant-e", "key-2")).expect("admit succeeds");

    let run_one = harness.registry.get_run(&outcome_one.run_id).expect("get succeeds").expect("run present");
    let run_two = harness.registry.get_run(&outcome_two.run_id).expect("get succeeds").expect("run present");
    assert_ne!(run_one.seed, run_two.seed);

    let expected_seed = derive_seed("tenant-e", "key-1", dyocense_core::admission::SEED_SALT);
    assert_eq!(run_one.seed, expected_seed);
}
