// dyocense-core/src/registry.rs
// ============================================================================
// Module: Run Registry
// Description: Durable record of runs and stages; single writer per run.
// Purpose: Own Run and StageRecord mutation exclusively.
// Dependencies: crate::{identifiers, model}
// ============================================================================

//! ## Overview
//! The Run Registry is the only component permitted to mutate a [`Run`] or
//! its [`crate::model::StageRecord`]s. Updates to a single run are
//! serialized (per-run lock or optimistic version, backend's choice);
//! `cancel` only sets a cooperative marker the Pipeline Engine observes
//! before each stage and at stage checkpoints.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::fingerprint::HashDigest;
use crate::identifiers::ContentRef;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::model::Run;
use crate::model::StageRecord;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by a Run Registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No run exists with the given id.
    #[error("run {0} not found")]
    NotFound(RunId),
    /// A run with this id already exists (admission must never retry with a
    /// colliding id; this is a defensive check).
    #[error("run {0} already exists")]
    AlreadyExists(RunId),
    /// The caller attempted to write a stale version of the run.
    #[error("run {0} was concurrently modified")]
    Conflict(RunId),
    /// The backend is transiently unavailable.
    #[error("run registry unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// SECTION: List Filter
// ============================================================================

/// Filter applied by [`RunRegistry::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to runs in one of these states, if non-empty.
    pub states: Vec<crate::model::RunState>,
    /// Restrict to runs created at or after this Unix-millis timestamp.
    pub created_after: Option<i64>,
    /// Maximum number of runs to return.
    pub limit: Option<usize>,
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Durable or in-memory backend owning run and stage-record state.
pub trait RunRegistry: Send + Sync {
    /// Persists a newly admitted run. Fails if the id already exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyExists`] or
    /// [`RegistryError::Unavailable`].
    fn create_run(&self, run: Run) -> Result<(), RegistryError>;

    /// Replaces a single stage's record on an existing run.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Unavailable`].
    fn update_stage(&self, run_id: &RunId, stage: StageRecord) -> Result<(), RegistryError>;

    /// Transitions a run's overall state, stamping `terminal_at` when the new
    /// state is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Unavailable`].
    fn set_run_state(
        &self,
        run_id: &RunId,
        state: crate::model::RunState,
        at: i64,
    ) -> Result<(), RegistryError>;

    /// Records a computed fingerprint, evidence reference, or snapshot hash
    /// against the run. Each `Some` argument overwrites the corresponding
    /// field; `None` leaves it unchanged, so callers may post one field at a
    /// time (e.g. `plan_dna` at terminal state, `evidence_ref` once the
    /// evidence write lands).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Unavailable`].
    fn append_fingerprint(
        &self,
        run_id: &RunId,
        model_fingerprint: Option<HashDigest>,
        plan_dna: Option<HashDigest>,
        evidence_ref: Option<ContentRef>,
        snapshot_hash: Option<HashDigest>,
    ) -> Result<(), RegistryError>;

    /// Fetches a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] on a backend error.
    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, RegistryError>;

    /// Lists runs for a tenant matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] on a backend error.
    fn list_runs(&self, tenant_id: &TenantId, filter: &RunFilter) -> Result<Vec<Run>, RegistryError>;

    /// Sets the cooperative cancellation marker observed by the Pipeline
    /// Engine; accepted in `admitted` or `running` states, idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Unavailable`].
    fn cancel(&self, run_id: &RunId, at: i64) -> Result<(), RegistryError>;

    /// Returns whether cancellation has been requested for a run.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Unavailable`].
    fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RegistryError>;
}
