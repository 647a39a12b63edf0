// dyocense-store-sqlite/tests/kernel_store_contract.rs
// ============================================================================
// Module: SQLite Kernel Store Contract Tests
// Description: Runs the shared RunRegistry/IdempotencyIndex/BudgetAccountant
//              contract against the durable SQLite backend.
// Purpose: Confirm the durable backend agrees with the in-memory fakes on
//          the one behavioral contract both must satisfy.
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

use dyocense_core::budget::CapResolver;
use dyocense_core::identifiers::RunId;
use dyocense_core::identifiers::TenantId;
use dyocense_core::model::BudgetVector;
use dyocense_core::testkit::contract::budget_accountant_contract;
use dyocense_core::testkit::contract::idempotency_index_contract;
use dyocense_core::testkit::contract::run_registry_contract;
use dyocense_store_sqlite::SqliteKernelStore;
use dyocense_store_sqlite::SqliteKernelStoreConfig;
use dyocense_store_sqlite::SqliteSyncMode;
use tempfile::TempDir;

struct FixedCaps(BudgetVector);

impl CapResolver for FixedCaps {
    fn cap_for(&self, _tenant_id: &TenantId, _period: &str) -> BudgetVector {
        self.0
    }
}

fn open_store(dir: &TempDir) -> SqliteKernelStore {
    let config = SqliteKernelStoreConfig {
        path: dir.path().join("kernel.sqlite3"),
        sync_mode: SqliteSyncMode::Normal,
        busy_timeout_ms: 2_000,
    };
    let caps = Arc::new(FixedCaps(BudgetVector { solver_sec: 200.0, llm_tokens: 200.0, gpu_sec: 200.0 }));
    SqliteKernelStore::new(config, caps).expect("store opens")
}

#[test]
fn run_registry_satisfies_the_shared_contract() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    run_registry_contract(&store, RunId::new("contract-run-1"), TenantId::new("contract-tenant-1"));
}

#[test]
fn idempotency_index_satisfies_the_shared_contract() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    idempotency_index_contract(&store, TenantId::new("contract-tenant-2"), RunId::new("contract-run-2"));
}

#[test]
fn budget_accountant_satisfies_the_shared_contract() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    budget_accountant_contract(
        &store,
        &TenantId::new("contract-tenant-3"),
        &RunId::new("contract-run-3"),
        "2026-08",
        200.0,
    );
}

#[test]
fn reopening_the_same_database_preserves_prior_state() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("kernel.sqlite3");
    let caps = Arc::new(FixedCaps(BudgetVector { solver_sec: 200.0, llm_tokens: 200.0, gpu_sec: 200.0 }));

    let run_id = RunId::new("durable-run");
    {
        let store = SqliteKernelStore::new(
            SqliteKernelStoreConfig { path: path.clone(), sync_mode: SqliteSyncMode::Full, busy_timeout_ms: 2_000 },
            caps.clone(),
        )
        .expect("first open");
        let run = dyocense_core::model::Run::new(
            run_id.clone(),
            TenantId::new("durable-tenant"),
            dyocense_core::model::Tier::Pro,
            "durable goal".to_string(),
            5,
            dyocense_core::identifiers::IdempotencyKey::new("durable-key"),
            10,
        );
        use dyocense_core::registry::RunRegistry;
        store.create_run(run).expect("create run");
    }

    let reopened = SqliteKernelStore::new(
        SqliteKernelStoreConfig { path, sync_mode: SqliteSyncMode::Full, busy_timeout_ms: 2_000 },
        caps,
    )
    .expect("second open");
    use dyocense_core::registry::RunRegistry;
    let loaded = reopened.get_run(&run_id).expect("get run").expect("run persisted across reopen");
    assert_eq!(loaded.goal, "durable goal");
}
