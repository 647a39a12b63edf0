// dyocense-core/src/interfaces.rs
// ============================================================================
// Module: Stage Adapters & Tenant Resolver
// Description: Backend-agnostic interfaces the engine invokes but never implements.
// Purpose: Keep LLM/solver/forecast/policy logic out of the core crate.
// Dependencies: crate::{identifiers, model}, serde_json
// ============================================================================

//! ## Overview
//! Every stage beyond bookkeeping is a pluggable capability. The core defines
//! only the contract — pure function semantics from input plus seed to
//! output, given a pinned code version — never an algorithm. Implementations
//! must be deterministic for identical canonical input, seed, and code
//! version, and must not embed raw tenant identifiers or PII into artifacts
//! beyond what the contract enumerates.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Value;
use thiserror::Error;

use crate::identifiers::CodeVersion;
use crate::model::Tenant;
use crate::model::TenantProfile;

// ============================================================================
// SECTION: Adapter Error
// ============================================================================

/// Errors a stage adapter raises at its boundary, pre-classified into the
/// taxonomy the Pipeline Engine persists onto a [`crate::model::StageRecord`].
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter is transiently unavailable (retryable).
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
    /// The adapter's input failed validation.
    #[error("invalid adapter input: {0}")]
    InvalidInput(String),
    /// The adapter raised a non-retryable logic error.
    #[error("adapter logic error: {0}")]
    Logic(String),
    /// The adapter did not complete within its cooperative checkpoint budget.
    #[error("adapter timed out")]
    TimedOut,
}

/// A stage adapter's output together with the code version that produced it,
/// used by the engine's output-fingerprint idempotence check.
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// Code version that produced `value`.
    pub code_version: CodeVersion,
    /// Stage output payload.
    pub value: Value,
}

// ============================================================================
// SECTION: Stage Adapters
// ============================================================================

/// Translates a goal and tabular context into the canonical OPS document.
pub trait Compiler: Send + Sync {
    /// Compiles `input` (the `{goal_text, tables_profile, tenant_ctx}`
    /// envelope) into an OPS document plus validation notes.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input, unavailability, or timeout.
    fn compile(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

/// Produces a scenario set and demand/lead-time statistics from an OPS
/// document's series.
pub trait Forecaster: Send + Sync {
    /// Forecasts `num_scenarios` scenarios over `horizon` periods.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input, unavailability, or timeout.
    fn forecast(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

/// Evaluates governance constraints against the compiled OPS and forecast.
pub trait PolicyGuard: Send + Sync {
    /// Evaluates `input` (`{ops, tenant_ctx}`) and returns a policy snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input or unavailability. Denial is
    /// not an error: it is expressed as `allow: false` in the returned value.
    fn evaluate(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

/// Solves the optimization problem and produces a solution pack.
pub trait Optimiser: Send + Sync {
    /// Solves `input` (`{ops, scenarios, warm_start?, time_limit, mip_gap,
    /// seed}`) and returns a solution pack.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input, unavailability, or timeout.
    /// Infeasibility and unboundedness are not errors: they are expressed via
    /// `status` in the returned value.
    fn optimise(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

/// Produces advisory relaxation suggestions after an infeasible solve.
pub trait Diagnostician: Send + Sync {
    /// Diagnoses `input` (`{ops, partial_solution?, policy}`) and returns
    /// relaxation suggestions.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input, unavailability, or timeout.
    fn diagnose(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

/// Produces a natural-language narrative for the run's outcome.
pub trait Explainer: Send + Sync {
    /// Explains `input` (`{ops, pack, forecasts, policy, diagnostics?}`).
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on invalid input, unavailability, or timeout.
    fn explain(&self, input: &Value, seed: u64) -> Result<AdapterOutput, AdapterError>;
}

// ============================================================================
// SECTION: Tenant Resolver
// ============================================================================

/// Errors raised while resolving a tenant's identity and tier.
#[derive(Debug, Error)]
pub enum TenantResolverError {
    /// No tenant matches the supplied identifier.
    #[error("tenant unknown: {0}")]
    Unknown(String),
    /// The resolver backend is unavailable.
    #[error("tenant resolver unavailable: {0}")]
    Unavailable(String),
}

/// External identity and tier collaborator the Admission Controller consumes
/// to resolve `{tenant_id, tier, caps, weights}` — authentication itself is
/// out of scope; this trait only returns the resolved profile.
pub trait TenantResolver: Send + Sync {
    /// Resolves a tenant identifier into its current tier profile.
    ///
    /// # Errors
    ///
    /// Returns [`TenantResolverError`] when the tenant is unknown or the
    /// resolver backend is unavailable.
    fn resolve(&self, tenant_id: &str) -> Result<Tenant, TenantResolverError>;
}

/// Convenience extension used by the Admission Controller to pull just the
/// profile out of a resolved tenant.
pub fn profile_of(tenant: &Tenant) -> TenantProfile {
    tenant.profile
}
