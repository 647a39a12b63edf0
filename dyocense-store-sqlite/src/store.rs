// dyocense-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Kernel Store
// Description: Durable RunRegistry, IdempotencyIndex, and BudgetAccountant.
// Purpose: Persist run/stage state, the idempotency index, and the budget
//          ledger in one SQLite database with WAL durability.
// Dependencies: dyocense-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! [`SqliteKernelStore`] is the durable collaborator behind three of the
//! Decision Kernel's core traits. Each run is stored as an append-only
//! sequence of canonical JSON snapshots (one row per mutation), mirroring
//! the versioned-snapshot pattern a single-writer-per-run registry needs;
//! the idempotency index and budget ledger are plain append-only tables.
//! Every read-back is re-hashed and compared against its stored digest
//! before being trusted, so a tampered database fails closed rather than
//! handing back silently corrupted state.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use dyocense_core::budget::BudgetAccountant;
use dyocense_core::budget::BudgetError;
use dyocense_core::budget::BudgetReport;
use dyocense_core::budget::CapResolver;
use dyocense_core::budget::CostVector;
use dyocense_core::budget::limiting_kinds;
use dyocense_core::budget::reserve_entries;
use dyocense_core::budget::totals_for;
use dyocense_core::fingerprint::DEFAULT_HASH_ALGORITHM;
use dyocense_core::fingerprint::HashDigest;
use dyocense_core::fingerprint::canonical_json_bytes;
use dyocense_core::fingerprint::hash_bytes;
use dyocense_core::identifiers::ContentRef;
use dyocense_core::identifiers::IdempotencyKey;
use dyocense_core::identifiers::ReservationId;
use dyocense_core::identifiers::RunId;
use dyocense_core::identifiers::TenantId;
use dyocense_core::idempotency::IdempotencyError;
use dyocense_core::idempotency::IdempotencyIndex;
use dyocense_core::model::BudgetKind;
use dyocense_core::model::BudgetLedgerEntry;
use dyocense_core::model::IdempotencyRecord;
use dyocense_core::model::LedgerReason;
use dyocense_core::model::Run;
use dyocense_core::model::RunState;
use dyocense_core::model::StageRecord;
use dyocense_core::registry::RegistryError;
use dyocense_core::registry::RunFilter;
use dyocense_core::registry::RunRegistry;
use rand::Rng;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::params;

use crate::connection::SqliteSyncMode;
use crate::connection::ensure_parent_dir;
use crate::connection::open_connection;
use crate::connection::validate_store_path;
use crate::error::SqliteStoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Schema version for this store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum serialized run size accepted by the registry.
pub const MAX_RUN_BYTES: usize = 8 * 1024 * 1024;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for [`SqliteKernelStore`].
#[derive(Debug, Clone)]
pub struct SqliteKernelStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// `SQLite` synchronous mode.
    pub sync_mode: SqliteSyncMode,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteKernelStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dyocense.sqlite3"),
            sync_mode: SqliteSyncMode::Full,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed `RunRegistry` + `IdempotencyIndex` + `BudgetAccountant`.
pub struct SqliteKernelStore {
    /// Shared connection guarded by a mutex; every public method runs in a
    /// single transaction against it.
    connection: Arc<Mutex<Connection>>,
    /// Resolves a tenant's budget cap for a period.
    cap_resolver: Arc<dyn CapResolver>,
}

impl SqliteKernelStore {
    /// Opens (creating if absent) the `SQLite`-backed kernel store.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened,
    /// initialized, or its schema does not match this build.
    pub fn new(
        config: SqliteKernelStoreConfig,
        cap_resolver: Arc<dyn CapResolver>,
    ) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(&config.path, config.sync_mode, config.busy_timeout_ms)?;
        initialize_schema(&mut connection)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)), cap_resolver })
    }

    /// Runs `body` inside a transaction against the shared connection.
    fn with_transaction<T>(
        &self,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let mut guard =
            self.connection.lock().map_err(|_| SqliteStoreError::Db("mutex poisoned".to_string()))?;
        let tx = guard.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let result = body(&tx)?;
        tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        Ok(result)
    }
}

// ============================================================================
// SECTION: Schema
// ============================================================================

/// Initializes the schema or validates an existing database's version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            tx.execute_batch(
                "CREATE TABLE runs (
                    run_id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    latest_version INTEGER NOT NULL
                );
                CREATE INDEX idx_runs_tenant ON runs (tenant_id, created_at);
                CREATE TABLE run_versions (
                    run_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    run_json BLOB NOT NULL,
                    run_hash TEXT NOT NULL,
                    saved_at INTEGER NOT NULL,
                    PRIMARY KEY (run_id, version),
                    FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
                );
                CREATE TABLE run_cancellations (
                    run_id TEXT PRIMARY KEY,
                    requested_at INTEGER NOT NULL,
                    FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
                );
                CREATE TABLE idempotency_records (
                    tenant_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, key)
                );
                CREATE TABLE budget_ledger (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    period TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    delta REAL NOT NULL,
                    reason TEXT NOT NULL,
                    reservation_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    ts INTEGER NOT NULL
                );
                CREATE INDEX idx_ledger_tenant_period
                    ON budget_ledger (tenant_id, period);
                CREATE INDEX idx_ledger_reservation
                    ON budget_ledger (reservation_id);",
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

// ============================================================================
// SECTION: Run Registry
// ============================================================================

impl RunRegistry for SqliteKernelStore {
    fn create_run(&self, run: Run) -> Result<(), RegistryError> {
        self.with_transaction(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run.run_id.as_str()], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            if exists.is_some() {
                return Err(SqliteStoreError::Conflict(format!(
                    "run {} already exists",
                    run.run_id
                )));
            }
            tx.execute(
                "INSERT INTO runs (run_id, tenant_id, state, created_at, latest_version) VALUES \
                 (?1, ?2, ?3, ?4, 1)",
                params![
                    run.run_id.as_str(),
                    run.tenant_id.as_str(),
                    run_state_label(run.state),
                    run.created_at
                ],
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            write_version(tx, &run.run_id, 1, &run, run.created_at)?;
            Ok(())
        })
        .map_err(|err| map_registry_error(err, &run.run_id))
    }

    fn update_stage(&self, run_id: &RunId, stage: StageRecord) -> Result<(), RegistryError> {
        self.mutate_run(run_id, |run| {
            if let Some(existing) = run.stage_mut(stage.name) {
                *existing = stage;
            }
        })
    }

    fn set_run_state(&self, run_id: &RunId, state: RunState, at: i64) -> Result<(), RegistryError> {
        self.mutate_run(run_id, |run| {
            run.state = state;
            if state.is_terminal() {
                run.terminal_at = Some(at);
            }
        })
    }

    fn append_fingerprint(
        &self,
        run_id: &RunId,
        model_fingerprint: Option<HashDigest>,
        plan_dna: Option<HashDigest>,
        evidence_ref: Option<ContentRef>,
        snapshot_hash: Option<HashDigest>,
    ) -> Result<(), RegistryError> {
        self.mutate_run(run_id, |run| {
            if model_fingerprint.is_some() {
                run.fingerprints.model_fingerprint = model_fingerprint.clone();
            }
            if plan_dna.is_some() {
                run.fingerprints.plan_dna = plan_dna.clone();
            }
            if evidence_ref.is_some() {
                run.fingerprints.evidence_ref = evidence_ref.clone();
            }
            if snapshot_hash.is_some() {
                run.fingerprints.snapshot_hash = snapshot_hash.clone();
            }
        })
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, RegistryError> {
        self.with_transaction(|tx| fetch_latest_run(tx, run_id))
            .map_err(|err| map_registry_error(err, run_id))
    }

    fn list_runs(&self, tenant_id: &TenantId, filter: &RunFilter) -> Result<Vec<Run>, RegistryError> {
        self.with_transaction(|tx| {
            let created_after = filter.created_after.unwrap_or(i64::MIN);
            let mut statement = tx
                .prepare(
                    "SELECT run_id FROM runs WHERE tenant_id = ?1 AND created_at >= ?2 ORDER BY \
                     created_at ASC",
                )
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            let run_ids: Vec<String> = statement
                .query_map(params![tenant_id.as_str(), created_after], |row| row.get(0))
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            drop(statement);
            let mut runs = Vec::new();
            for run_id in run_ids {
                let run_id = RunId::new(run_id);
                if let Some(run) = fetch_latest_run(tx, &run_id)? {
                    if filter.states.is_empty() || filter.states.contains(&run.state) {
                        runs.push(run);
                    }
                }
            }
            if let Some(limit) = filter.limit {
                runs.truncate(limit);
            }
            Ok(runs)
        })
        .map_err(|err| map_registry_error(err, &RunId::new("")))
    }

    fn cancel(&self, run_id: &RunId, at: i64) -> Result<(), RegistryError> {
        self.with_transaction(|tx| {
            ensure_run_exists(tx, run_id)?;
            tx.execute(
                "INSERT OR IGNORE INTO run_cancellations (run_id, requested_at) VALUES (?1, ?2)",
                params![run_id.as_str(), at],
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            Ok(())
        })
        .map_err(|err| map_registry_error(err, run_id))
    }

    fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RegistryError> {
        self.with_transaction(|tx| {
            ensure_run_exists(tx, run_id)?;
            let requested: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM run_cancellations WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            Ok(requested.is_some())
        })
        .map_err(|err| map_registry_error(err, run_id))
    }
}

impl SqliteKernelStore {
    /// Loads a run, applies `mutate`, and writes the next version row.
    fn mutate_run(
        &self,
        run_id: &RunId,
        mutate: impl FnOnce(&mut Run),
    ) -> Result<(), RegistryError> {
        self.with_transaction(|tx| {
            let (current_version, mut run) = fetch_latest_run_versioned(tx, run_id)?
                .ok_or_else(|| SqliteStoreError::NotFound(run_id.to_string()))?;
            mutate(&mut run);
            let next_version = current_version
                .checked_add(1)
                .ok_or_else(|| SqliteStoreError::Corrupt(format!("version overflow for run {run_id}")))?;
            tx.execute(
                "UPDATE runs SET state = ?1, latest_version = ?2 WHERE run_id = ?3",
                params![run_state_label(run.state), next_version, run_id.as_str()],
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            write_version(tx, run_id, next_version, &run, run.created_at)?;
            Ok(())
        })
        .map_err(|err| map_registry_error(err, run_id))
    }
}

/// Writes a new canonical snapshot row for `run` at `version`.
fn write_version(
    tx: &Transaction<'_>,
    run_id: &RunId,
    version: i64,
    run: &Run,
    saved_at: i64,
) -> Result<(), SqliteStoreError> {
    let canonical_json = canonical_json_bytes(run).map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
    if canonical_json.len() > MAX_RUN_BYTES {
        return Err(SqliteStoreError::Invalid(format!(
            "run {run_id} exceeds size limit: {} bytes (max {MAX_RUN_BYTES})",
            canonical_json.len()
        )));
    }
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, &canonical_json);
    tx.execute(
        "INSERT INTO run_versions (run_id, version, run_json, run_hash, saved_at) VALUES (?1, ?2, \
         ?3, ?4, ?5)",
        params![run_id.as_str(), version, canonical_json, digest.value, saved_at],
    )
    .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Fetches the latest run snapshot, verifying its stored hash.
fn fetch_latest_run(tx: &Transaction<'_>, run_id: &RunId) -> Result<Option<Run>, SqliteStoreError> {
    Ok(fetch_latest_run_versioned(tx, run_id)?.map(|(_, run)| run))
}

/// Fetches the latest run snapshot together with its version number.
fn fetch_latest_run_versioned(
    tx: &Transaction<'_>,
    run_id: &RunId,
) -> Result<Option<(i64, Run)>, SqliteStoreError> {
    let latest_version: Option<i64> = tx
        .query_row(
            "SELECT latest_version FROM runs WHERE run_id = ?1",
            params![run_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let Some(version) = latest_version else {
        return Ok(None);
    };
    let (run_json, run_hash): (Vec<u8>, String) = tx
        .query_row(
            "SELECT run_json, run_hash FROM run_versions WHERE run_id = ?1 AND version = ?2",
            params![run_id.as_str(), version],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let expected = hash_bytes(DEFAULT_HASH_ALGORITHM, &run_json);
    if expected.value != run_hash {
        return Err(SqliteStoreError::Corrupt(format!("hash mismatch for run {run_id}")));
    }
    let run: Run =
        serde_json::from_slice(&run_json).map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
    Ok(Some((version, run)))
}

/// Returns an error if no run exists with the given id.
fn ensure_run_exists(tx: &Transaction<'_>, run_id: &RunId) -> Result<(), SqliteStoreError> {
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run_id.as_str()], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    if exists.is_none() {
        return Err(SqliteStoreError::NotFound(run_id.to_string()));
    }
    Ok(())
}

/// Stable string label for a run state, used as a queryable column.
const fn run_state_label(state: RunState) -> &'static str {
    match state {
        RunState::Admitted => "admitted",
        RunState::Running => "running",
        RunState::Succeeded => "succeeded",
        RunState::SucceededPartial => "succeeded_partial",
        RunState::Failed => "failed",
        RunState::Denied => "denied",
        RunState::Canceled => "canceled",
    }
}

/// Maps a backend error into the `RunRegistry` error taxonomy.
fn map_registry_error(error: SqliteStoreError, run_id: &RunId) -> RegistryError {
    match error {
        SqliteStoreError::NotFound(_) => RegistryError::NotFound(run_id.clone()),
        SqliteStoreError::Conflict(_) => RegistryError::AlreadyExists(run_id.clone()),
        other => RegistryError::Unavailable(other.to_string()),
    }
}

// ============================================================================
// SECTION: Idempotency Index
// ============================================================================

impl IdempotencyIndex for SqliteKernelStore {
    fn lookup(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
        now: i64,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.with_transaction(|tx| {
            let row: Option<(String, i64, i64)> = tx
                .query_row(
                    "SELECT run_id, created_at, expires_at FROM idempotency_records WHERE \
                     tenant_id = ?1 AND key = ?2",
                    params![tenant_id.as_str(), key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            let Some((run_id, created_at, expires_at)) = row else {
                return Ok(None);
            };
            if now >= expires_at {
                return Ok(None);
            }
            Ok(Some(IdempotencyRecord {
                tenant_id: tenant_id.clone(),
                key: key.clone(),
                run_id: RunId::new(run_id),
                created_at,
                expires_at,
            }))
        })
        .map_err(|err| IdempotencyError::Unavailable(err.to_string()))
    }

    fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        self.with_transaction(|tx| {
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT run_id, expires_at FROM idempotency_records WHERE tenant_id = ?1 AND \
                     key = ?2",
                    params![record.tenant_id.as_str(), record.key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            if let Some((existing_run_id, expires_at)) = existing {
                if record.created_at < expires_at {
                    return Err(SqliteStoreError::Conflict(existing_run_id));
                }
            }
            tx.execute(
                "INSERT INTO idempotency_records (tenant_id, key, run_id, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(tenant_id, key) DO UPDATE SET run_id = \
                 excluded.run_id, created_at = excluded.created_at, expires_at = excluded.expires_at",
                params![
                    record.tenant_id.as_str(),
                    record.key.as_str(),
                    record.run_id.as_str(),
                    record.created_at,
                    record.expires_at
                ],
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            Ok(())
        })
        .map_err(|err| match err {
            SqliteStoreError::Conflict(existing_run_id) => {
                IdempotencyError::AlreadyBound { existing_run_id: RunId::new(existing_run_id) }
            }
            other => IdempotencyError::Unavailable(other.to_string()),
        })
    }

    fn purge_tenant(&self, tenant_id: &TenantId) -> Result<(), IdempotencyError> {
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM idempotency_records WHERE tenant_id = ?1",
                params![tenant_id.as_str()],
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            Ok(())
        })
        .map_err(|err| IdempotencyError::Unavailable(err.to_string()))
    }
}

// ============================================================================
// SECTION: Budget Accountant
// ============================================================================

impl BudgetAccountant for SqliteKernelStore {
    fn reserve(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        period: &str,
        cost: CostVector,
        ts: i64,
    ) -> Result<ReservationId, BudgetError> {
        let cap = self.cap_resolver.cap_for(tenant_id, period);
        let outcome = self.with_transaction(|tx| {
            let entries = load_ledger_entries(tx, tenant_id, period)?;
            let reports: Vec<BudgetReport> = cost
                .components()
                .iter()
                .map(|(kind, _)| totals_for(&entries, *kind, cap.cap(*kind)))
                .collect();
            let limiting = limiting_kinds(&reports, &cost);
            if !limiting.is_empty() {
                return Ok(Err(limiting));
            }
            let reservation_id = ReservationId::new(new_reservation_id());
            for entry in reserve_entries(
                tenant_id.clone(),
                period.to_string(),
                reservation_id.clone(),
                run_id.clone(),
                cost,
                ts,
            ) {
                insert_ledger_entry(tx, &entry)?;
            }
            Ok(Ok(reservation_id))
        })
        .map_err(|err| BudgetError::Unavailable(err.to_string()))?;
        outcome.map_err(|limiting_kinds| BudgetError::Exhausted {
            tenant_id: tenant_id.clone(),
            limiting_kinds,
        })
    }

    fn commit(&self, reservation_id: &ReservationId, actual: CostVector, ts: i64) -> Result<(), BudgetError> {
        self.with_transaction(|tx| {
            let reservation = load_reservation(tx, reservation_id)?;
            let Some((tenant_id, period, run_id, reserved)) = reservation else {
                return Err(SqliteStoreError::NotFound(reservation_id.to_string()));
            };
            if reservation_already_resolved(tx, reservation_id)? {
                return Err(SqliteStoreError::Conflict(reservation_id.to_string()));
            }
            for (kind, reserved_amount) in reserved.components() {
                let actual_amount = actual.component(kind);
                if actual_amount > 0.0 {
                    insert_ledger_entry(
                        tx,
                        &BudgetLedgerEntry {
                            tenant_id: tenant_id.clone(),
                            period: period.clone(),
                            kind,
                            delta: actual_amount,
                            reason: LedgerReason::Commit,
                            reservation_id: reservation_id.clone(),
                            run_id: run_id.clone(),
                            ts,
                        },
                    )?;
                }
                let refund = (reserved_amount - actual_amount).max(0.0);
                if refund > 0.0 {
                    insert_ledger_entry(
                        tx,
                        &BudgetLedgerEntry {
                            tenant_id: tenant_id.clone(),
                            period: period.clone(),
                            kind,
                            delta: refund,
                            reason: LedgerReason::Refund,
                            reservation_id: reservation_id.clone(),
                            run_id: run_id.clone(),
                            ts,
                        },
                    )?;
                }
            }
            Ok(())
        })
        .map_err(|err| map_budget_error(err, reservation_id))
    }

    fn release(&self, reservation_id: &ReservationId, ts: i64) -> Result<(), BudgetError> {
        self.with_transaction(|tx| {
            let reservation = load_reservation(tx, reservation_id)?;
            let Some((tenant_id, period, run_id, reserved)) = reservation else {
                return Err(SqliteStoreError::NotFound(reservation_id.to_string()));
            };
            if reservation_already_resolved(tx, reservation_id)? {
                return Err(SqliteStoreError::Conflict(reservation_id.to_string()));
            }
            for (kind, reserved_amount) in reserved.components() {
                if reserved_amount > 0.0 {
                    insert_ledger_entry(
                        tx,
                        &BudgetLedgerEntry {
                            tenant_id: tenant_id.clone(),
                            period: period.clone(),
                            kind,
                            delta: reserved_amount,
                            reason: LedgerReason::Release,
                            reservation_id: reservation_id.clone(),
                            run_id: run_id.clone(),
                            ts,
                        },
                    )?;
                }
            }
            Ok(())
        })
        .map_err(|err| map_budget_error(err, reservation_id))
    }

    fn query(&self, tenant_id: &TenantId, period: &str) -> Result<Vec<BudgetReport>, BudgetError> {
        let cap = self.cap_resolver.cap_for(tenant_id, period);
        self.with_transaction(|tx| {
            let entries = load_ledger_entries(tx, tenant_id, period)?;
            Ok([BudgetKind::SolverSec, BudgetKind::LlmTokens, BudgetKind::GpuSec]
                .into_iter()
                .map(|kind| totals_for(&entries, kind, cap.cap(kind)))
                .collect())
        })
        .map_err(|err| BudgetError::Unavailable(err.to_string()))
    }
}

/// Loads every ledger entry posted for a tenant and period.
fn load_ledger_entries(
    tx: &Transaction<'_>,
    tenant_id: &TenantId,
    period: &str,
) -> Result<Vec<BudgetLedgerEntry>, SqliteStoreError> {
    let mut statement = tx
        .prepare(
            "SELECT kind, delta, reason, reservation_id, run_id, ts FROM budget_ledger WHERE \
             tenant_id = ?1 AND period = ?2",
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let rows = statement
        .query_map(params![tenant_id.as_str(), period], |row| {
            let kind: String = row.get(0)?;
            let delta: f64 = row.get(1)?;
            let reason: String = row.get(2)?;
            let reservation_id: String = row.get(3)?;
            let run_id: String = row.get(4)?;
            let ts: i64 = row.get(5)?;
            Ok((kind, delta, reason, reservation_id, run_id, ts))
        })
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let mut entries = Vec::new();
    for row in rows {
        let (kind, delta, reason, reservation_id, run_id, ts) =
            row.map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        entries.push(BudgetLedgerEntry {
            tenant_id: tenant_id.clone(),
            period: period.to_string(),
            kind: parse_budget_kind(&kind)?,
            delta,
            reason: parse_ledger_reason(&reason)?,
            reservation_id: ReservationId::new(reservation_id),
            run_id: RunId::new(run_id),
            ts,
        });
    }
    Ok(entries)
}

/// Inserts a single ledger posting.
fn insert_ledger_entry(tx: &Transaction<'_>, entry: &BudgetLedgerEntry) -> Result<(), SqliteStoreError> {
    tx.execute(
        "INSERT INTO budget_ledger (tenant_id, period, kind, delta, reason, reservation_id, \
         run_id, ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.tenant_id.as_str(),
            entry.period,
            budget_kind_label(entry.kind),
            entry.delta,
            ledger_reason_label(entry.reason),
            entry.reservation_id.as_str(),
            entry.run_id.as_str(),
            entry.ts
        ],
    )
    .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Loads the tenant, period, run, and reserved amounts for a reservation.
fn load_reservation(
    tx: &Transaction<'_>,
    reservation_id: &ReservationId,
) -> Result<Option<(TenantId, String, RunId, CostVector)>, SqliteStoreError> {
    let mut statement = tx
        .prepare(
            "SELECT tenant_id, period, run_id, kind, delta FROM budget_ledger WHERE \
             reservation_id = ?1 AND reason = 'reserve'",
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let rows = statement
        .query_map(params![reservation_id.as_str()], |row| {
            let tenant_id: String = row.get(0)?;
            let period: String = row.get(1)?;
            let run_id: String = row.get(2)?;
            let kind: String = row.get(3)?;
            let delta: f64 = row.get(4)?;
            Ok((tenant_id, period, run_id, kind, delta))
        })
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let mut tenant_id = None;
    let mut period = None;
    let mut run_id = None;
    let mut cost = CostVector::default();
    for row in rows {
        let (row_tenant, row_period, row_run, row_kind, row_delta) =
            row.map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        tenant_id = Some(row_tenant);
        period = Some(row_period);
        run_id = Some(row_run);
        match parse_budget_kind(&row_kind)? {
            BudgetKind::SolverSec => cost.solver_sec += row_delta,
            BudgetKind::LlmTokens => cost.llm_tokens += row_delta,
            BudgetKind::GpuSec => cost.gpu_sec += row_delta,
        }
    }
    let (Some(tenant_id), Some(period), Some(run_id)) = (tenant_id, period, run_id) else {
        return Ok(None);
    };
    Ok(Some((TenantId::new(tenant_id), period, RunId::new(run_id), cost)))
}

/// Returns whether a reservation already has a commit, release, or refund
/// posting against it.
fn reservation_already_resolved(
    tx: &Transaction<'_>,
    reservation_id: &ReservationId,
) -> Result<bool, SqliteStoreError> {
    let resolved: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM budget_ledger WHERE reservation_id = ?1 AND reason IN ('commit', \
             'release') LIMIT 1",
            params![reservation_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(resolved.is_some())
}

/// Generates a fresh, random reservation id.
fn new_reservation_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:032x}", rng.r#gen::<u128>())
}

/// Stable string label for a budget resource kind.
const fn budget_kind_label(kind: BudgetKind) -> &'static str {
    match kind {
        BudgetKind::SolverSec => "solver_sec",
        BudgetKind::LlmTokens => "llm_tokens",
        BudgetKind::GpuSec => "gpu_sec",
    }
}

/// Parses a budget resource kind label.
fn parse_budget_kind(label: &str) -> Result<BudgetKind, SqliteStoreError> {
    match label {
        "solver_sec" => Ok(BudgetKind::SolverSec),
        "llm_tokens" => Ok(BudgetKind::LlmTokens),
        "gpu_sec" => Ok(BudgetKind::GpuSec),
        other => Err(SqliteStoreError::Invalid(format!("unknown budget kind: {other}"))),
    }
}

/// Stable string label for a ledger posting reason.
const fn ledger_reason_label(reason: LedgerReason) -> &'static str {
    match reason {
        LedgerReason::Reserve => "reserve",
        LedgerReason::Commit => "commit",
        LedgerReason::Release => "release",
        LedgerReason::Refund => "refund",
    }
}

/// Parses a ledger posting reason label.
fn parse_ledger_reason(label: &str) -> Result<LedgerReason, SqliteStoreError> {
    match label {
        "reserve" => Ok(LedgerReason::Reserve),
        "commit" => Ok(LedgerReason::Commit),
        "release" => Ok(LedgerReason::Release),
        "refund" => Ok(LedgerReason::Refund),
        other => Err(SqliteStoreError::Invalid(format!("unknown ledger reason: {other}"))),
    }
}

/// Maps a backend error into the `BudgetAccountant` error taxonomy.
fn map_budget_error(error: SqliteStoreError, reservation_id: &ReservationId) -> BudgetError {
    match error {
        SqliteStoreError::NotFound(_) => BudgetError::NotFound(reservation_id.clone()),
        SqliteStoreError::Conflict(_) => BudgetError::AlreadyResolved(reservation_id.clone()),
        other => BudgetError::Unavailable(other.to_string()),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test fixtures use explicit asserts and unwraps for clarity."
    )]

    use dyocense_core::identifiers::IdempotencyKey;
    use dyocense_core::identifiers::StageName;
    use dyocense_core::model::BudgetVector;
    use dyocense_core::model::StageState;
    use dyocense_core::model::Tier;
    use tempfile::TempDir;

    use super::*;

    struct FixedCaps(BudgetVector);

    impl CapResolver for FixedCaps {
        fn cap_for(&self, _tenant_id: &TenantId, _period: &str) -> BudgetVector {
            self.0
        }
    }

    fn store_in(dir: &TempDir) -> SqliteKernelStore {
        let config = SqliteKernelStoreConfig {
            path: dir.path().join("kernel.sqlite3"),
            sync_mode: SqliteSyncMode::Full,
            busy_timeout_ms: 1_000,
        };
        let caps = Arc::new(FixedCaps(BudgetVector { solver_sec: 100.0, llm_tokens: 100.0, gpu_sec: 100.0 }));
        SqliteKernelStore::new(config, caps).expect("store init")
    }

    fn sample_run(run_id: &str) -> Run {
        Run::new(
            RunId::new(run_id),
            TenantId::new("tenant-1"),
            Tier::Standard,
            "reduce cost".to_string(),
            7,
            IdempotencyKey::new("key-1"),
            1_000,
        )
    }

    #[test]
    fn create_and_get_run_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let run = sample_run("run-1");
        store.create_run(run.clone()).expect("create");
        let loaded = store.get_run(&run.run_id).expect("get").expect("present");
        assert_eq!(loaded, run);
    }

    #[test]
    fn create_run_rejects_duplicate_id() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let run = sample_run("run-1");
        store.create_run(run.clone()).expect("create");
        let result = store.create_run(run);
        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
    }

    #[test]
    fn update_stage_persists_a_new_version() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let run = sample_run("run-1");
        store.create_run(run.clone()).expect("create");
        let mut stage = StageRecord::pending(StageName::Compile);
        stage.state = StageState::Succeeded;
        stage.attempts = 1;
        store.update_stage(&run.run_id, stage.clone()).expect("update");
        let loaded = store.get_run(&run.run_id).expect("get").expect("present");
        assert_eq!(loaded.stage(StageName::Compile), Some(&stage));
    }

    #[test]
    fn cancel_then_query_marks_run_as_cancellation_requested() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let run = sample_run("run-1");
        store.create_run(run.clone()).expect("create");
        assert!(!store.is_cancellation_requested(&run.run_id).expect("check"));
        store.cancel(&run.run_id, 2_000).expect("cancel");
        assert!(store.is_cancellation_requested(&run.run_id).expect("check"));
    }

    #[test]
    fn idempotency_insert_then_lookup_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let record = IdempotencyRecord {
            tenant_id: TenantId::new("tenant-1"),
            key: IdempotencyKey::new("key-1"),
            run_id: RunId::new("run-1"),
            created_at: 0,
            expires_at: 10_000,
        };
        store.insert(record.clone()).expect("insert");
        let looked_up = store
            .lookup(&record.tenant_id, &record.key, 500)
            .expect("lookup")
            .expect("present");
        assert_eq!(looked_up, record);
        assert!(store.lookup(&record.tenant_id, &record.key, 20_000).expect("lookup").is_none());
    }

    #[test]
    fn idempotency_insert_rejects_live_duplicate() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let record = IdempotencyRecord {
            tenant_id: TenantId::new("tenant-1"),
            key: IdempotencyKey::new("key-1"),
            run_id: RunId::new("run-1"),
            created_at: 0,
            expires_at: 10_000,
        };
        store.insert(record.clone()).expect("insert");
        let mut duplicate = record;
        duplicate.run_id = RunId::new("run-2");
        let result = store.insert(duplicate);
        assert!(matches!(result, Err(IdempotencyError::AlreadyBound { .. })));
    }

    #[test]
    fn budget_reserve_then_commit_refunds_unused_portion() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let tenant_id = TenantId::new("tenant-1");
        let run_id = RunId::new("run-1");
        let reservation = store
            .reserve(&tenant_id, &run_id, "2026-08", CostVector { solver_sec: 10.0, ..CostVector::default() }, 0)
            .expect("reserve");
        store
            .commit(&reservation, CostVector { solver_sec: 6.0, ..CostVector::default() }, 1)
            .expect("commit");
        let reports = store.query(&tenant_id, "2026-08").expect("query");
        let solver_report =
            reports.into_iter().find(|report| report.kind == BudgetKind::SolverSec).expect("report");
        assert!((solver_report.committed - 6.0).abs() < f64::EPSILON);
        assert!((solver_report.reserved - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn budget_reserve_over_cap_is_exhausted() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let tenant_id = TenantId::new("tenant-1");
        let run_id = RunId::new("run-1");
        let result = store.reserve(
            &tenant_id,
            &run_id,
            "2026-08",
            CostVector { solver_sec: 1_000.0, ..CostVector::default() },
            0,
        );
        assert!(matches!(result, Err(BudgetError::Exhausted { .. })));
    }

    #[test]
    fn budget_commit_twice_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let tenant_id = TenantId::new("tenant-1");
        let run_id = RunId::new("run-1");
        let reservation = store
            .reserve(&tenant_id, &run_id, "2026-08", CostVector { solver_sec: 10.0, ..CostVector::default() }, 0)
            .expect("reserve");
        store
            .commit(&reservation, CostVector { solver_sec: 6.0, ..CostVector::default() }, 1)
            .expect("commit");
        let result = store.commit(&reservation, CostVector { solver_sec: 1.0, ..CostVector::default() }, 2);
        assert!(matches!(result, Err(BudgetError::AlreadyResolved(_))));
    }
}
