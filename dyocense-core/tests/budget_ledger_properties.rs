// dyocense-core/tests/budget_ledger_properties.rs
// ============================================================================
// Module: Budget Ledger Property Tests
// Description: Property-based checks that the append-only ledger never lets
//              committed usage exceed a tenant's cap, regardless of the
//              reserve/commit/release sequence applied to it.
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    missing_docs,
    reason = "Property test bodies assert via unwrap/expect on generated inputs."
)]

use dyocense_core::budget::BudgetAccountant;
use dyocense_core::budget::BudgetError;
use dyocense_core::budget::CostVector;
use dyocense_core::identifiers::RunId;
use dyocense_core::identifiers::TenantId;
use dyocense_core::model::BudgetKind;
use dyocense_core::model::BudgetVector;
use dyocense_core::testkit::InMemoryBudgetAccountant;
use proptest::prelude::*;

/// One step of a generated reservation lifecycle: reserve an amount, then
/// either commit an actual amount (possibly less, never more, than reserved)
/// or release the whole reservation.
#[derive(Debug, Clone)]
enum Step {
    ReserveThenCommit { requested: f64, actual_fraction: f64 },
    ReserveThenRelease { requested: f64 },
}

fn step_strategy(cap: f64) -> impl Strategy<Value = Step> {
    prop_oneof![
        (0.0..=cap, 0.0..=1.0_f64)
            .prop_map(|(requested, actual_fraction)| Step::ReserveThenCommit { requested, actual_fraction }),
        (0.0..=cap).prop_map(|requested| Step::ReserveThenRelease { requested }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No matter how reservations are interleaved with commits and releases,
    /// the accountant never reports committed usage above the tenant's cap,
    /// and a reservation that would exceed the cap's headroom is always
    /// rejected rather than silently admitted.
    #[test]
    fn committed_usage_never_exceeds_the_cap(steps in proptest::collection::vec(step_strategy(100.0), 1..12)) {
        let accountant = InMemoryBudgetAccountant::new();
        let tenant_id = TenantId::new("prop-tenant");
        let cap = BudgetVector { solver_sec: 100.0, llm_tokens: 100.0, gpu_sec: 100.0 };
        accountant.set_cap(tenant_id.clone(), cap);
        let period = "2026-08";

        for (index, step) in steps.into_iter().enumerate() {
            let run_id = RunId::new(format!("prop-run-{index}"));
            match step {
                Step::ReserveThenCommit { requested, actual_fraction } => {
                    let cost = CostVector { solver_sec: requested, ..CostVector::default() };
                    match accountant.reserve(&tenant_id, &run_id, period, cost, 0) {
                        Ok(reservation_id) => {
                            let actual = CostVector { solver_sec: requested * actual_fraction, ..CostVector::default() };
                            accountant.commit(&reservation_id, actual, 1).expect("commit on a fresh reservation succeeds");
                        }
                        Err(BudgetError::Exhausted { limiting_kinds, .. }) => {
                            prop_assert!(limiting_kinds.contains(&BudgetKind::SolverSec));
                        }
                        Err(other) => prop_assert!(false, "unexpected reserve error: {other}"),
                    }
                }
                Step::ReserveThenRelease { requested } => {
                    let cost = CostVector { solver_sec: requested, ..CostVector::default() };
                    if let Ok(reservation_id) = accountant.reserve(&tenant_id, &run_id, period, cost, 0) {
                        accountant.release(&reservation_id, 1).expect("release on a fresh reservation succeeds");
                    }
                }
            }

            let reports = accountant.query(&tenant_id, period).expect("query always succeeds");
            let solver_report = reports
                .into_iter()
                .find(|report| report.kind == BudgetKind::SolverSec)
                .expect("solver report is present");
            prop_assert!(solver_report.committed <= cap.solver_sec + f64::EPSILON);
            prop_assert!(solver_report.committed + solver_report.reserved <= cap.solver_sec + 1e-6);
        }
    }

    /// A reservation, once committed, can never be committed or released a
    /// second time.
    #[test]
    fn a_resolved_reservation_rejects_any_further_resolution(requested in 0.0..50.0_f64, actual in 0.0..50.0_f64) {
        let accountant = InMemoryBudgetAccountant::new();
        let tenant_id = TenantId::new("prop-tenant-2");
        accountant.set_cap(tenant_id.clone(), BudgetVector { solver_sec: 100.0, llm_tokens: 100.0, gpu_sec: 100.0 });
        let run_id = RunId::new("prop-run");

        let reservation_id = accountant
            .reserve(&tenant_id, &run_id, "2026-08", CostVector { solver_sec: requested, ..CostVector::default() }, 0)
            .expect("reservation within cap succeeds");
        accountant
            .commit(&reservation_id, CostVector { solver_sec: actual.min(requested), ..CostVector::default() }, 1)
            .expect("first commit succeeds");

        let second_commit = accountant.commit(&reservation_id, CostVector::default(), 2);
        prop_assert!(matches!(second_commit, Err(BudgetError::AlreadyResolved(_))));
        let release_after_commit = accountant.release(&reservation_id, 3);
        prop_assert!(matches!(release_after_commit, Err(BudgetError::AlreadyResolved(_))));
    }
}
