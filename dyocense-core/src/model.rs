// dyocense-core/src/model.rs
// ============================================================================
// Module: Kernel Data Model
// Description: Tenant, Run, StageRecord, and the other owned record types.
// Purpose: Define the shapes every component reads and mutates.
// Dependencies: crate::{identifiers, fingerprint}, serde
// ============================================================================

//! ## Overview
//! These types are the nouns of the orchestrator: a `Tenant` resolved
//! externally, a `Run` the Admission Controller creates and the Run Registry
//! owns, one `StageRecord` per pipeline stage, and the ledger/index entries
//! owned exclusively by the Budget Accountant and Idempotency Index.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::fingerprint::HashDigest;
use crate::identifiers::ContentRef;
use crate::identifiers::IdempotencyKey;
use crate::identifiers::ReservationId;
use crate::identifiers::RunId;
use crate::identifiers::StageName;
use crate::identifiers::TenantId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while constructing or validating a model value.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A required field was empty or otherwise malformed.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

// ============================================================================
// SECTION: Tenant
// ============================================================================

/// Tenant service tier, controlling caps, weights, timeouts, and concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free tier: lowest weight, tightest caps.
    Free,
    /// Standard paid tier.
    Standard,
    /// Pro tier: higher weight and caps.
    Pro,
    /// Enterprise tier: highest weight, bespoke caps.
    Enterprise,
}

/// Per-component monthly budget cap, indexed by resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetVector {
    /// Monthly solver-seconds cap.
    pub solver_sec: f64,
    /// Monthly LLM token cap.
    pub llm_tokens: f64,
    /// Monthly GPU-seconds cap.
    pub gpu_sec: f64,
}

/// Resource kind tracked by the Budget Accountant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Solver wall-clock seconds.
    SolverSec,
    /// LLM tokens consumed by Compile/Explain.
    LlmTokens,
    /// GPU-seconds consumed by Forecast/Optimise.
    GpuSec,
}

impl BudgetVector {
    /// Returns the cap for a single resource kind.
    #[must_use]
    pub const fn cap(&self, kind: BudgetKind) -> f64 {
        match kind {
            BudgetKind::SolverSec => self.solver_sec,
            BudgetKind::LlmTokens => self.llm_tokens,
            BudgetKind::GpuSec => self.gpu_sec,
        }
    }
}

/// Tenant tier-derived timeout table, one wall-clock cap per stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Compile stage timeout, milliseconds.
    pub compile_ms: u64,
    /// Forecast stage timeout, milliseconds.
    pub forecast_ms: u64,
    /// Policy stage timeout, milliseconds.
    pub policy_ms: u64,
    /// Optimise stage timeout, milliseconds.
    pub optimise_ms: u64,
    /// Diagnose stage timeout, milliseconds.
    pub diagnose_ms: u64,
    /// Explain stage timeout, milliseconds.
    pub explain_ms: u64,
    /// Evidence stage timeout, milliseconds.
    pub evidence_ms: u64,
}

impl StageTimeouts {
    /// Returns the timeout for a single named stage.
    #[must_use]
    pub const fn for_stage(&self, stage: StageName) -> u64 {
        match stage {
            StageName::Compile => self.compile_ms,
            StageName::Forecast => self.forecast_ms,
            StageName::Policy => self.policy_ms,
            StageName::Optimise => self.optimise_ms,
            StageName::Diagnose => self.diagnose_ms,
            StageName::Explain => self.explain_ms,
            StageName::Evidence => self.evidence_ms,
        }
    }

    /// Returns the global pipeline cap: sum of stage caps scaled by 1.25,
    /// plus scheduling slack, per the concurrency model's global timeout rule.
    #[must_use]
    pub fn global_cap_ms(&self, scheduling_slack_ms: u64) -> u64 {
        let sum = self.compile_ms
            + self.forecast_ms
            + self.policy_ms
            + self.optimise_ms
            + self.diagnose_ms
            + self.explain_ms
            + self.evidence_ms;
        #[allow(
            clippy::cast_possible_truncation,
            reason = "sum of millisecond caps stays far below u64::MAX in practice"
        )]
        let scaled = ((sum as f64) * 1.25) as u64;
        scaled + scheduling_slack_ms
    }
}

/// Per-tenant caps resolved from tier configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TenantCaps {
    /// Maximum concurrently running runs for this tenant.
    pub max_parallel_runs: u32,
    /// Maximum scenarios a single Forecast stage may request.
    pub max_scenarios: u32,
    /// Maximum horizon (periods) a single Forecast stage may request.
    pub max_horizon: u32,
    /// Per-stage wall-clock timeout table.
    pub stage_timeouts: StageTimeouts,
    /// Floor on the optimality gap a solver may accept.
    pub mip_gap_floor: f64,
    /// Monthly budget cap vector.
    pub budget: BudgetVector,
}

/// WFQ weight and concurrency/budget caps resolved for a tenant at admission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TenantProfile {
    /// Resolved tier.
    pub tier: Tier,
    /// WFQ weight (`w_t`); higher receives proportionally more service.
    pub weight: f64,
    /// Resolved caps for the tier.
    pub caps: TenantCaps,
}

/// A tenant as resolved by the external identity/tier collaborator.
///
/// # Invariants
/// - `tenant_id` is stable for the tenant's lifetime; the core treats it as
///   opaque and never derives it from request content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Tenant's current profile (tier, weight, caps).
    pub profile: TenantProfile,
}

// ============================================================================
// SECTION: Stage Record
// ============================================================================

/// Lifecycle state of a single stage attempt within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Queued, not yet invoked.
    Pending,
    /// Adapter invocation in flight.
    Running,
    /// Adapter returned a successful result.
    Succeeded,
    /// Adapter returned a non-retryable error, or retries were exhausted.
    Failed,
    /// Stage was not reached because of an upstream branch decision.
    Skipped,
    /// Stage exceeded its tier-derived wall-clock cap.
    TimedOut,
    /// Stage was abandoned due to run cancellation.
    Canceled,
}

impl StageState {
    /// Returns whether this state is terminal for the stage (no further
    /// attempts will be recorded against it).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Machine-stable error classification, matching the taxonomy strings a
/// caller-visible failure must carry alongside `run_id`, terminal state, and
/// failing stage name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed schema or size validation.
    Validation,
    /// Authentication failed.
    AuthFailed,
    /// Tenant could not be resolved.
    TenantUnknown,
    /// Budget reservation would exceed the tenant's cap.
    BudgetExhausted,
    /// Policy stage denied the run.
    PolicyDenied,
    /// The policy adapter raised a non-retryable evaluation error (distinct
    /// from a denial, and from request-shape `Validation` at admission).
    PolicyEvalError,
    /// Optimise stage reported an infeasible model.
    Infeasible,
    /// Optimise stage exhausted its time limit but kept an incumbent.
    TimeoutPartial,
    /// A stage exceeded its wall-clock cap without a partial incumbent.
    TimedOut,
    /// An adapter reported itself as transiently unavailable.
    AdapterUnavailable,
    /// A storage backend reported itself as transiently unavailable.
    StoreUnavailable,
    /// The solver adapter raised a non-retryable logic error.
    SolverError,
    /// The forecast adapter raised a non-retryable logic error.
    ForecastError,
    /// The explain adapter raised a non-retryable logic error.
    ExplainError,
    /// The run was canceled by its owner.
    Canceled,
    /// A worker crashed and re-queue attempts were exhausted.
    InfrastructureError,
    /// The run exceeded its global pipeline timeout.
    PipelineTimeout,
}

impl ErrorKind {
    /// Returns whether a stage failing with this kind is eligible for retry.
    ///
    /// Only the two transient-unavailability kinds are retried, per the
    /// pipeline's bounded-retry policy; validation and policy errors are
    /// never retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::AdapterUnavailable | Self::StoreUnavailable)
    }
}

/// One attempt/outcome record for a single pipeline stage within a run.
///
/// # Invariants
/// - A stage reaches a terminal [`StageState`] at most once; retries append
///   new attempt numbers, and only the last attempt's terminal state is
///   authoritative for the stage.
/// - `output_ref` is content-addressed: identical `(stage, canonical_input,
///   code_version)` yields an identical `output_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage this record describes.
    pub name: StageName,
    /// Current lifecycle state.
    pub state: StageState,
    /// Number of invocation attempts made so far (1-indexed).
    pub attempts: u32,
    /// Wall-clock time the stage entered `running`, if it has started.
    pub started_at: Option<i64>,
    /// Wall-clock time the stage reached a terminal state, if any.
    pub ended_at: Option<i64>,
    /// Content reference for the canonical input the stage consumed.
    pub input_ref: Option<ContentRef>,
    /// Content reference for the stage's output, once produced.
    pub output_ref: Option<ContentRef>,
    /// Error classification, present only when `state` denotes a failure.
    pub error_kind: Option<ErrorKind>,
    /// Redacted, human-readable error message, present only on failure.
    pub error_msg: Option<String>,
    /// Canonical fingerprint of this stage's output, once produced.
    pub fingerprint: Option<HashDigest>,
}

impl StageRecord {
    /// Creates a fresh, `pending` record for a stage with zero attempts.
    #[must_use]
    pub const fn pending(name: StageName) -> Self {
        Self {
            name,
            state: StageState::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            input_ref: None,
            output_ref: None,
            error_kind: None,
            error_msg: None,
            fingerprint: None,
        }
    }
}

// ============================================================================
// SECTION: Run
// ============================================================================

/// Overall run lifecycle state.
///
/// # Invariants
/// - Progresses monotonically; the first transition out of `Admitted` must be
///   into `Running`; all other variants are terminal and idempotent once
///   reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted by the Admission Controller, not yet dispatched.
    Admitted,
    /// Dispatched to a worker; stages are executing.
    Running,
    /// All stages completed without a policy denial or partial incumbent.
    Succeeded,
    /// Completed with a partial/advisory result (timeout-partial or infeasible-diagnosed).
    SucceededPartial,
    /// A critical stage failed with a non-retryable or exhausted-retry error.
    Failed,
    /// The Policy stage denied the run.
    Denied,
    /// The run was canceled by its owner.
    Canceled,
}

impl RunState {
    /// Returns whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Admitted | Self::Running)
    }
}

/// Fingerprints computed over a run's stage boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFingerprints {
    /// Hash of the compiled OPS document minus volatile fields.
    pub model_fingerprint: Option<HashDigest>,
    /// Hash of the run's full semantic result.
    pub plan_dna: Option<HashDigest>,
    /// Content reference the evidence graph was written under.
    pub evidence_ref: Option<ContentRef>,
    /// Canonical hash of the written evidence graph.
    pub snapshot_hash: Option<HashDigest>,
}

/// A single orchestrated run, owned exclusively by the Run Registry.
///
/// # Invariants
/// - `run_id` is globally unique and immutable once assigned.
/// - `(tenant_id, idempotency_key)` maps to exactly one `run_id` for the
///   idempotency TTL window.
/// - `seed` is fixed at admission; stages needing randomness derive from it.
/// - `budget_reservation` is released (committed or refunded) exactly once,
///   at terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique run identifier.
    pub run_id: RunId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Tenant tier snapshot at admission time.
    pub tier_snapshot: Tier,
    /// Free-text business goal supplied by the caller.
    pub goal: String,
    /// Deterministic seed derived at admission.
    pub seed: u64,
    /// Idempotency key supplied by the caller.
    pub idempotency_key: IdempotencyKey,
    /// Unix-millis creation timestamp.
    pub created_at: i64,
    /// Current lifecycle state.
    pub state: RunState,
    /// One record per pipeline stage, in DAG order.
    pub stages: Vec<StageRecord>,
    /// Fingerprints computed so far.
    pub fingerprints: RunFingerprints,
    /// Budget reservation identifier held for this run, if any.
    pub budget_reservation: Option<ReservationId>,
    /// Unix-millis timestamp the run reached a terminal state.
    pub terminal_at: Option<i64>,
    /// When this run is itself a duplicate submission, the original run id.
    pub duplicate_of: Option<RunId>,
}

impl Run {
    /// Builds a fresh `admitted` run with all seven stages `pending`.
    #[must_use]
    pub fn new(
        run_id: RunId,
        tenant_id: TenantId,
        tier_snapshot: Tier,
        goal: String,
        seed: u64,
        idempotency_key: IdempotencyKey,
        created_at: i64,
    ) -> Self {
        let stages = [
            StageName::Compile,
            StageName::Forecast,
            StageName::Policy,
            StageName::Optimise,
            StageName::Diagnose,
            StageName::Explain,
            StageName::Evidence,
        ]
        .into_iter()
        .map(StageRecord::pending)
        .collect();

        Self {
            run_id,
            tenant_id,
            tier_snapshot,
            goal,
            seed,
            idempotency_key,
            created_at,
            state: RunState::Admitted,
            stages,
            fingerprints: RunFingerprints::default(),
            budget_reservation: None,
            terminal_at: None,
            duplicate_of: None,
        }
    }

    /// Returns a mutable reference to a stage's record by name.
    pub fn stage_mut(&mut self, name: StageName) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|record| record.name == name)
    }

    /// Returns a reference to a stage's record by name.
    #[must_use]
    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }
}

// ============================================================================
// SECTION: Redacted Run Summary
// ============================================================================

/// Redacted, policy-safe projection of a [`Run`] suitable for a user-visible
/// failure message: terminal state, failing stage, `error_kind`, and a
/// redacted message, with no tenant PII or stage artifact content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: RunId,
    /// Run's terminal (or current) state.
    pub state: RunState,
    /// Name of the first stage that failed, if any.
    pub failing_stage: Option<StageName>,
    /// Classification of the failure, if any.
    pub error_kind: Option<ErrorKind>,
    /// Redacted human-readable message, if any.
    pub message: Option<String>,
}

impl RunSummary {
    /// Projects a [`Run`] into its redacted summary.
    #[must_use]
    pub fn from_run(run: &Run) -> Self {
        let failing = run
            .stages
            .iter()
            .find(|record| matches!(record.state, StageState::Failed | StageState::TimedOut));

        Self {
            run_id: run.run_id.clone(),
            state: run.state,
            failing_stage: failing.map(|record| record.name),
            error_kind: failing.and_then(|record| record.error_kind),
            message: failing.and_then(|record| record.error_msg.clone()),
        }
    }
}

// ============================================================================
// SECTION: Idempotency Record
// ============================================================================

/// Mapping owned exclusively by the Idempotency Index.
///
/// # Invariants
/// - `(tenant_id, key)` is unique among non-expired records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Caller-supplied idempotency key.
    pub key: IdempotencyKey,
    /// Run id this key resolves to.
    pub run_id: RunId,
    /// Unix-millis creation timestamp.
    pub created_at: i64,
    /// Unix-millis expiry timestamp.
    pub expires_at: i64,
}

// ============================================================================
// SECTION: Budget Ledger Entry
// ============================================================================

/// Reason an amount was posted to the budget ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Budget held at admission, pending commit or release.
    Reserve,
    /// Measured usage applied against a reservation.
    Commit,
    /// Unused reservation returned in full.
    Release,
    /// Unused portion of a reservation returned after a partial commit.
    Refund,
}

/// One append-only posting against a tenant's budget, owned exclusively by
/// the Budget Accountant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedgerEntry {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Billing period key, e.g. `"2026-08"`.
    pub period: String,
    /// Resource kind this posting affects.
    pub kind: BudgetKind,
    /// Signed delta applied to the running total (negative for releases).
    pub delta: f64,
    /// Reason this posting was made.
    pub reason: LedgerReason,
    /// Reservation this posting belongs to.
    pub reservation_id: ReservationId,
    /// Run this posting is attributed to.
    pub run_id: RunId,
    /// Unix-millis posting timestamp.
    pub ts: i64,
}
