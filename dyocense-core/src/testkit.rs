// dyocense-core/src/testkit.rs
// ============================================================================
// Module: In-Memory Test Doubles
// Description: Minimal, correct fakes for every collaborator trait.
// Purpose: Let integration tests (in this crate and in durable-backend crates)
//          exercise the engine and admission flow without external services.
// Dependencies: crate::{model, interfaces, idempotency, budget, registry, evidence}
// ============================================================================

//! ## Overview
//! Each fake is a `Mutex`-guarded in-memory map, the same interior-mutability
//! shape the durable SQLite backend uses for its own locking. These are not
//! mocks that assert call counts — they implement the trait's full contract,
//! so the same test suite can run again against a durable backend unchanged.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::budget::BudgetAccountant;
use crate::budget::BudgetError;
use crate::budget::BudgetReport;
use crate::budget::CostVector;
use crate::budget::totals_for;
use crate::evidence::EvidenceGraph;
use crate::evidence::EvidenceStore;
use crate::evidence::EvidenceStoreError;
use crate::fingerprint::DEFAULT_HASH_ALGORITHM;
use crate::fingerprint::hash_bytes;
use crate::idempotency::IdempotencyError;
use crate::idempotency::IdempotencyIndex;
use crate::identifiers::ContentRef;
use crate::identifiers::IdempotencyKey;
use crate::identifiers::ReservationId;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::interfaces::AdapterError;
use crate::interfaces::AdapterOutput;
use crate::interfaces::Compiler;
use crate::interfaces::Diagnostician;
use crate::interfaces::Explainer;
use crate::interfaces::Forecaster;
use crate::interfaces::Optimiser;
use crate::interfaces::PolicyGuard;
use crate::interfaces::TenantResolver;
use crate::interfaces::TenantResolverError;
use crate::model::BudgetKind;
use crate::model::BudgetLedgerEntry;
use crate::model::IdempotencyRecord;
use crate::model::LedgerReason;
use crate::model::Run;
use crate::model::Tenant;
use crate::model::TenantProfile;
use crate::registry::RegistryError;
use crate::registry::RunFilter;
use crate::registry::RunRegistry;

// ============================================================================
// SECTION: Run Registry Fake
// ============================================================================

/// In-memory [`RunRegistry`]; one entry per run, no concurrent-version checks
/// beyond what a single process-wide mutex already serializes.
#[derive(Default)]
pub struct InMemoryRunRegistry {
    runs: Mutex<HashMap<RunId, Run>>,
    canceled: Mutex<std::collections::HashSet<RunId>>,
}

impl InMemoryRunRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRegistry for InMemoryRunRegistry {
    fn create_run(&self, run: Run) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if runs.contains_key(&run.run_id) {
            return Err(RegistryError::AlreadyExists(run.run_id));
        }
        runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    fn update_stage(&self, run_id: &RunId, stage: crate::model::StageRecord) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let run = runs.get_mut(run_id).ok_or_else(|| RegistryError::NotFound(run_id.clone()))?;
        if let Some(existing) = run.stage_mut(stage.name) {
            *existing = stage;
        }
        Ok(())
    }

    fn set_run_state(
        &self,
        run_id: &RunId,
        state: crate::model::RunState,
        at: i64,
    ) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let run = runs.get_mut(run_id).ok_or_else(|| RegistryError::NotFound(run_id.clone()))?;
        run.state = state;
        if state.is_terminal() {
            run.terminal_at = Some(at);
        }
        Ok(())
    }

    fn append_fingerprint(
        &self,
        run_id: &RunId,
        model_fingerprint: Option<crate::fingerprint::HashDigest>,
        plan_dna: Option<crate::fingerprint::HashDigest>,
        evidence_ref: Option<ContentRef>,
        snapshot_hash: Option<crate::fingerprint::HashDigest>,
    ) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let run = runs.get_mut(run_id).ok_or_else(|| RegistryError::NotFound(run_id.clone()))?;
        if model_fingerprint.is_some() {
            run.fingerprints.model_fingerprint = model_fingerprint;
        }
        if plan_dna.is_some() {
            run.fingerprints.plan_dna = plan_dna;
        }
        if evidence_ref.is_some() {
            run.fingerprints.evidence_ref = evidence_ref;
        }
        if snapshot_hash.is_some() {
            run.fingerprints.snapshot_hash = snapshot_hash;
        }
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, RegistryError> {
        let runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(runs.get(run_id).cloned())
    }

    fn list_runs(&self, tenant_id: &TenantId, filter: &RunFilter) -> Result<Vec<Run>, RegistryError> {
        let runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matched: Vec<Run> = runs
            .values()
            .filter(|run| &run.tenant_id == tenant_id)
            .filter(|run| filter.states.is_empty() || filter.states.contains(&run.state))
            .filter(|run| filter.created_after.is_none_or(|after| run.created_at >= after))
            .cloned()
            .collect();
        matched.sort_by_key(|run| run.created_at);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn cancel(&self, run_id: &RunId, _at: i64) -> Result<(), RegistryError> {
        let runs = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !runs.contains_key(run_id) {
            return Err(RegistryError::NotFound(run_id.clone()));
        }
        self.canceled.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(run_id.clone());
        Ok(())
    }

    fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RegistryError> {
        Ok(self.canceled.lock().unwrap_or_else(std::sync::PoisonError::into_inner).contains(run_id))
    }
}

// ============================================================================
// SECTION: Idempotency Index Fake
// ============================================================================

/// In-memory [`IdempotencyIndex`] keyed by `(tenant_id, key)`.
#[derive(Default)]
pub struct InMemoryIdempotencyIndex {
    records: Mutex<HashMap<(TenantId, IdempotencyKey), IdempotencyRecord>>,
}

impl InMemoryIdempotencyIndex {
    /// Builds an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyIndex for InMemoryIdempotencyIndex {
    fn lookup(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
        now: i64,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records
            .get(&(tenant_id.clone(), key.clone()))
            .filter(|record| crate::idempotency::is_live(record, now))
            .cloned())
    }

    fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (record.tenant_id.clone(), record.key.clone());
        if let Some(existing) = records.get(&key) {
            if crate::idempotency::is_live(existing, record.created_at) && existing.run_id != record.run_id {
                return Err(IdempotencyError::AlreadyBound { existing_run_id: existing.run_id.clone() });
            }
        }
        records.insert(key, record);
        Ok(())
    }

    fn purge_tenant(&self, tenant_id: &TenantId) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        records.retain(|(existing_tenant, _), _| existing_tenant != tenant_id);
        Ok(())
    }
}

// ============================================================================
// SECTION: Budget Accountant Fake
// ============================================================================

/// In-memory [`BudgetAccountant`] backed by an append-only ledger Vec, the
/// same aggregation-over-postings discipline a durable ledger table uses.
#[derive(Default)]
pub struct InMemoryBudgetAccountant {
    ledger: Mutex<Vec<BudgetLedgerEntry>>,
    caps: Mutex<HashMap<TenantId, crate::model::BudgetVector>>,
    next_reservation: std::sync::atomic::AtomicU64,
}

impl InMemoryBudgetAccountant {
    /// Builds an empty accountant.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the monthly cap vector used for a tenant's reservations.
    pub fn set_cap(&self, tenant_id: TenantId, cap: crate::model::BudgetVector) {
        self.caps.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(tenant_id, cap);
    }
}

/// Returns whether `reservation_id` already carries a `commit` or `release`
/// posting, the same resolved-once check the durable backend enforces.
fn already_resolved(ledger: &[BudgetLedgerEntry], reservation_id: &ReservationId) -> bool {
    ledger.iter().any(|entry| {
        &entry.reservation_id == reservation_id
            && matches!(entry.reason, LedgerReason::Commit | LedgerReason::Release)
    })
}

impl BudgetAccountant for InMemoryBudgetAccountant {
    fn reserve(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        period: &str,
        cost: CostVector,
        now: i64,
    ) -> Result<ReservationId, BudgetError> {
        let cap = self
            .caps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tenant_id)
            .copied()
            .unwrap_or(crate::model::BudgetVector {
                solver_sec: f64::MAX,
                llm_tokens: f64::MAX,
                gpu_sec: f64::MAX,
            });

        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut limiting = Vec::new();
        for kind in [BudgetKind::SolverSec, BudgetKind::LlmTokens, BudgetKind::GpuSec] {
            let report = totals_for(&ledger, kind, cap.cap(kind));
            if report.committed + report.reserved + cost.component(kind) > cap.cap(kind) {
                limiting.push(kind);
            }
        }
        if !limiting.is_empty() {
            return Err(BudgetError::Exhausted { tenant_id: tenant_id.clone(), limiting_kinds: limiting });
        }

        let reservation_id =
            ReservationId::new(format!("res-{}", self.next_reservation.fetch_add(1, std::sync::atomic::Ordering::Relaxed)));
        for (kind, amount) in [
            (BudgetKind::SolverSec, cost.solver_sec),
            (BudgetKind::LlmTokens, cost.llm_tokens),
            (BudgetKind::GpuSec, cost.gpu_sec),
        ] {
            ledger.push(BudgetLedgerEntry {
                tenant_id: tenant_id.clone(),
                period: period.to_string(),
                kind,
                delta: amount,
                reason: LedgerReason::Reserve,
                reservation_id: reservation_id.clone(),
                run_id: run_id.clone(),
                ts: now,
            });
        }
        Ok(reservation_id)
    }

    fn commit(
        &self,
        reservation_id: &ReservationId,
        actual: CostVector,
        now: i64,
    ) -> Result<(), BudgetError> {
        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let reserved = ledger
            .iter()
            .find(|entry| &entry.reservation_id == reservation_id && entry.reason == LedgerReason::Reserve)
            .cloned()
            .ok_or_else(|| BudgetError::NotFound(reservation_id.clone()))?;
        if already_resolved(&ledger, reservation_id) {
            return Err(BudgetError::AlreadyResolved(reservation_id.clone()));
        }

        for (kind, actual_amount) in [
            (BudgetKind::SolverSec, actual.solver_sec),
            (BudgetKind::LlmTokens, actual.llm_tokens),
            (BudgetKind::GpuSec, actual.gpu_sec),
        ] {
            let reserved_amount = ledger
                .iter()
                .find(|entry| &entry.reservation_id == reservation_id && entry.kind == kind)
                .map_or(0.0, |entry| entry.delta);
            let refund = reserved_amount - actual_amount;
            ledger.push(BudgetLedgerEntry {
                tenant_id: reserved.tenant_id.clone(),
                period: reserved.period.clone(),
                kind,
                delta: actual_amount,
                reason: LedgerReason::Commit,
                reservation_id: reservation_id.clone(),
                run_id: reserved.run_id.clone(),
                ts: now,
            });
            if refund.abs() > f64::EPSILON {
                ledger.push(BudgetLedgerEntry {
                    tenant_id: reserved.tenant_id.clone(),
                    period: reserved.period.clone(),
                    kind,
                    delta: -refund,
                    reason: LedgerReason::Refund,
                    reservation_id: reservation_id.clone(),
                    run_id: reserved.run_id.clone(),
                    ts: now,
                });
            }
        }
        Ok(())
    }

    fn release(&self, reservation_id: &ReservationId, now: i64) -> Result<(), BudgetError> {
        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let reserved: Vec<BudgetLedgerEntry> = ledger
            .iter()
            .filter(|entry| &entry.reservation_id == reservation_id && entry.reason == LedgerReason::Reserve)
            .cloned()
            .collect();
        if reserved.is_empty() {
            return Err(BudgetError::NotFound(reservation_id.clone()));
        }
        if already_resolved(&ledger, reservation_id) {
            return Err(BudgetError::AlreadyResolved(reservation_id.clone()));
        }
        for entry in reserved {
            ledger.push(BudgetLedgerEntry {
                tenant_id: entry.tenant_id,
                period: entry.period,
                kind: entry.kind,
                delta: -entry.delta,
                reason: LedgerReason::Release,
                reservation_id: reservation_id.clone(),
                run_id: entry.run_id,
                ts: now,
            });
        }
        Ok(())
    }

    fn query(&self, tenant_id: &TenantId, period: &str) -> Result<Vec<BudgetReport>, BudgetError> {
        let ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let filtered: Vec<BudgetLedgerEntry> = ledger
            .iter()
            .filter(|entry| &entry.tenant_id == tenant_id && entry.period == period)
            .cloned()
            .collect();
        let caps = self.caps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cap_vector = caps.get(tenant_id).copied().unwrap_or(crate::model::BudgetVector {
            solver_sec: f64::MAX,
            llm_tokens: f64::MAX,
            gpu_sec: f64::MAX,
        });
        Ok([BudgetKind::SolverSec, BudgetKind::LlmTokens, BudgetKind::GpuSec]
            .into_iter()
            .map(|kind| totals_for(&filtered, kind, cap_vector.cap(kind)))
            .collect())
    }
}

// ============================================================================
// SECTION: Evidence Store Fake
// ============================================================================

/// In-memory [`EvidenceStore`]; blobs keyed by their own content hash.
#[derive(Default)]
pub struct InMemoryEvidenceStore {
    graphs: Mutex<Vec<EvidenceGraph>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryEvidenceStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvidenceStore for InMemoryEvidenceStore {
    fn write_graph(&self, graph: &EvidenceGraph) -> Result<ContentRef, EvidenceStoreError> {
        graph.validate()?;
        let bytes = crate::fingerprint::canonical_json_bytes(graph)
            .map_err(|err| EvidenceStoreError::Unavailable(err.to_string()))?;
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        self.graphs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(graph.clone());
        Ok(ContentRef::new(digest.value))
    }

    fn put_blob(&self, bytes: &[u8]) -> Result<ContentRef, EvidenceStoreError> {
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, bytes);
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(digest.value.clone(), bytes.to_vec());
        Ok(ContentRef::new(digest.value))
    }
}

// ============================================================================
// SECTION: Tenant Resolver Fake
// ============================================================================

/// In-memory [`TenantResolver`] backed by a fixed map, for tests that do not
/// exercise live tier changes.
#[derive(Default)]
pub struct StaticTenantResolver {
    tenants: Mutex<HashMap<String, TenantProfile>>,
}

impl StaticTenantResolver {
    /// Builds a resolver with no registered tenants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tenant's profile.
    pub fn register(&self, tenant_id: impl Into<String>, profile: TenantProfile) {
        self.tenants.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(tenant_id.into(), profile);
    }
}

impl TenantResolver for StaticTenantResolver {
    fn resolve(&self, tenant_id: &str) -> Result<Tenant, TenantResolverError> {
        let tenants = self.tenants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tenants
            .get(tenant_id)
            .map(|profile| Tenant { tenant_id: TenantId::new(tenant_id), profile: *profile })
            .ok_or_else(|| TenantResolverError::Unknown(tenant_id.to_string()))
    }
}

// ============================================================================
// SECTION: Stage Adapter Fakes
// ============================================================================

/// Stage adapter fake that echoes its input back as output, tagged with a
/// fixed code version; used to exercise engine control flow without a real
/// compiler, forecaster, policy engine, solver, diagnostician, or explainer.
pub struct EchoAdapter {
    code_version: crate::identifiers::CodeVersion,
    response: Value,
}

impl EchoAdapter {
    /// Builds an adapter that always returns `response`.
    #[must_use]
    pub fn new(code_version: impl Into<String>, response: Value) -> Self {
        Self { code_version: crate::identifiers::CodeVersion::new(code_version), response }
    }

    fn respond(&self) -> Result<AdapterOutput, AdapterError> {
        Ok(AdapterOutput { code_version: self.code_version.clone(), value: self.response.clone() })
    }
}

impl Compiler for EchoAdapter {
    fn compile(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

impl Forecaster for EchoAdapter {
    fn forecast(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

impl PolicyGuard for EchoAdapter {
    fn evaluate(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

impl Optimiser for EchoAdapter {
    fn optimise(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

impl Diagnostician for EchoAdapter {
    fn diagnose(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

impl Explainer for EchoAdapter {
    fn explain(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        self.respond()
    }
}

/// Stage adapter fake that always fails the same way; used to exercise
/// retry, timeout, and failure-propagation paths.
pub struct FailingAdapter {
    error: fn() -> AdapterError,
}

impl FailingAdapter {
    /// Builds an adapter whose every invocation calls `error` for a fresh
    /// instance of the failure to return.
    #[must_use]
    pub const fn new(error: fn() -> AdapterError) -> Self {
        Self { error }
    }
}

impl Compiler for FailingAdapter {
    fn compile(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

impl Forecaster for FailingAdapter {
    fn forecast(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

impl PolicyGuard for FailingAdapter {
    fn evaluate(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

impl Optimiser for FailingAdapter {
    fn optimise(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

impl Diagnostician for FailingAdapter {
    fn diagnose(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

impl Explainer for FailingAdapter {
    fn explain(&self, _input: &Value, _seed: u64) -> Result<AdapterOutput, AdapterError> {
        Err((self.error)())
    }
}

// ============================================================================
// SECTION: Shared Backend Contracts
// ============================================================================

/// Behavioral contract functions shared by this crate's own fake tests and
/// `dyocense-store-sqlite`'s integration tests, so both backends are checked
/// against one definition of correct behavior rather than two copies that
/// can drift apart.
#[allow(
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    reason = "contract functions assert behavioral properties via expect/assert and are only ever invoked from tests"
)]
pub mod contract {
    use crate::budget::BudgetAccountant;
    use crate::budget::BudgetError;
    use crate::budget::CostVector;
    use crate::idempotency::IdempotencyError;
    use crate::idempotency::IdempotencyIndex;
    use crate::identifiers::IdempotencyKey;
    use crate::identifiers::RunId;
    use crate::identifiers::TenantId;
    use crate::model::BudgetKind;
    use crate::model::IdempotencyRecord;
    use crate::model::Run;
    use crate::model::RunState;
    use crate::model::StageState;
    use crate::model::Tier;
    use crate::registry::RegistryError;
    use crate::registry::RunRegistry;

    /// Exercises create/read/update/cancel against any [`RunRegistry`].
    ///
    /// # Panics
    ///
    /// Panics (via `assert!`) if the registry under test violates the
    /// create/update/cancel contract.
    pub fn run_registry_contract(registry: &dyn RunRegistry, run_id: RunId, tenant_id: TenantId) {
        let run = Run::new(
            run_id.clone(),
            tenant_id,
            Tier::Standard,
            "contract goal".to_string(),
            99,
            IdempotencyKey::new("contract-key"),
            1_000,
        );
        registry.create_run(run.clone()).expect("create succeeds once");
        assert!(matches!(registry.create_run(run.clone()), Err(RegistryError::AlreadyExists(_))));

        let loaded = registry.get_run(&run_id).expect("get succeeds").expect("run is present");
        assert_eq!(loaded.state, RunState::Admitted);

        let mut stage = loaded.stages[0].clone();
        stage.state = StageState::Succeeded;
        stage.attempts = 1;
        registry.update_stage(&run_id, stage.clone()).expect("update succeeds");
        let after_update = registry.get_run(&run_id).expect("get succeeds").expect("run is present");
        assert_eq!(after_update.stages[0].state, StageState::Succeeded);

        registry.set_run_state(&run_id, RunState::Running, 1_500).expect("transition succeeds");
        assert!(!registry.is_cancellation_requested(&run_id).expect("check succeeds"));
        registry.cancel(&run_id, 2_000).expect("cancel succeeds");
        assert!(registry.is_cancellation_requested(&run_id).expect("check succeeds"));
    }

    /// Exercises insert/lookup/expiry against any [`IdempotencyIndex`].
    ///
    /// # Panics
    ///
    /// Panics (via `assert!`) if the index under test violates the
    /// insert/lookup/expiry contract.
    pub fn idempotency_index_contract(index: &dyn IdempotencyIndex, tenant_id: TenantId, run_id: RunId) {
        let key = IdempotencyKey::new("contract-key");
        let record = IdempotencyRecord {
            tenant_id: tenant_id.clone(),
            key: key.clone(),
            run_id: run_id.clone(),
            created_at: 0,
            expires_at: 10_000,
        };
        index.insert(record.clone()).expect("first insert succeeds");

        let duplicate = IdempotencyRecord { run_id: RunId::new("other-run"), ..record.clone() };
        assert!(matches!(index.insert(duplicate), Err(IdempotencyError::AlreadyBound { .. })));

        let found = index.lookup(&tenant_id, &key, 500).expect("lookup succeeds");
        assert_eq!(found, Some(record));
        assert!(index.lookup(&tenant_id, &key, 50_000).expect("lookup succeeds").is_none());
    }

    /// Exercises reserve/commit/release/query against any [`BudgetAccountant`]
    /// already configured with `cap` as the tenant's cap for `period`.
    ///
    /// # Panics
    ///
    /// Panics (via `assert!`) if the accountant under test violates the
    /// reserve/commit/exhaustion contract.
    pub fn budget_accountant_contract(
        accountant: &dyn BudgetAccountant,
        tenant_id: &TenantId,
        run_id: &RunId,
        period: &str,
        cap: f64,
    ) {
        let half = cap / 2.0;
        let reservation = accountant
            .reserve(tenant_id, run_id, period, CostVector { solver_sec: half, ..CostVector::default() }, 0)
            .expect("reservation within cap succeeds");

        let over_cap = accountant.reserve(
            tenant_id,
            run_id,
            period,
            CostVector { solver_sec: cap, ..CostVector::default() },
            1,
        );
        assert!(matches!(over_cap, Err(BudgetError::Exhausted { .. })));

        accountant
            .commit(&reservation, CostVector { solver_sec: half / 2.0, ..CostVector::default() }, 2)
            .expect("commit succeeds");
        let reports = accountant.query(tenant_id, period).expect("query succeeds");
        let solver_report =
            reports.into_iter().find(|report| report.kind == BudgetKind::SolverSec).expect("solver report present");
        assert!((solver_report.committed - half / 2.0).abs() < f64::EPSILON);

        let double_commit = accountant.commit(&reservation, CostVector::default(), 3);
        assert!(matches!(double_commit, Err(BudgetError::AlreadyResolved(_))));

        let missing = crate::identifiers::ReservationId::new("contract-missing-reservation");
        let unresolved = accountant.release(&missing, 4);
        assert!(matches!(unresolved, Err(BudgetError::NotFound(_))));
    }
}
