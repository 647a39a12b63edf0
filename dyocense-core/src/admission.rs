// dyocense-core/src/admission.rs
// ============================================================================
// Module: Admission Controller
// Description: Validate, de-duplicate, reserve budget, and enqueue a run.
// Purpose: The single entry point that turns a submit request into a run_id.
// Dependencies: crate::{clock, model, interfaces, idempotency, budget, registry, scheduler}
// ============================================================================

//! ## Overview
//! Admission performs its seven steps in strict order, each fully resolved
//! before the next begins: resolve tenant, validate shape, check
//! idempotency, derive seed, estimate cost, reserve budget, then create the
//! run and enqueue it. Composition is by constructor injection: the
//! controller owns no ambient state of its own beyond what is passed in.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use thiserror::Error;

use crate::budget::BudgetAccountant;
use crate::budget::BudgetError;
use crate::budget::CostVector;
use crate::clock::Clock;
use crate::clock::derive_seed;
use crate::idempotency::DEFAULT_TTL_MS;
use crate::idempotency::IdempotencyError;
use crate::idempotency::IdempotencyIndex;
use crate::idempotency::new_record;
use crate::identifiers::IdempotencyKey;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::interfaces::TenantResolver;
use crate::interfaces::TenantResolverError;
use crate::model::BudgetKind;
use crate::model::Run;
use crate::registry::RegistryError;
use crate::registry::RunRegistry;
use crate::scheduler::SchedulerError;
use crate::scheduler::WfqScheduler;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum accepted `goal` length in bytes.
pub const MAX_GOAL_BYTES: usize = 8 * 1024;

/// Maximum accepted `idempotency_key` length in bytes.
pub const MAX_IDEMPOTENCY_KEY_BYTES: usize = 128;

/// Fixed salt mixed into seed derivation, per the admission flow's seed step.
pub const SEED_SALT: &str = "dyocense-admission-seed-v1";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Boundary error classifying an admission failure into the caller-visible
/// taxonomy; no run is ever created when one of these is returned (other
/// than the idempotent-replay case, which is not an error).
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The tenant could not be authenticated or resolved.
    #[error("tenant unknown: {0}")]
    TenantUnknown(String),
    /// The goal text exceeded [`MAX_GOAL_BYTES`].
    #[error("goal exceeds {MAX_GOAL_BYTES} bytes")]
    GoalTooLarge,
    /// The idempotency key exceeded [`MAX_IDEMPOTENCY_KEY_BYTES`].
    #[error("idempotency key exceeds {MAX_IDEMPOTENCY_KEY_BYTES} bytes")]
    IdempotencyKeyTooLarge,
    /// `num_scenarios` exceeded the tenant's tier maximum.
    #[error("num_scenarios {requested} exceeds tier maximum {max}")]
    TooManyScenarios {
        /// Requested scenario count.
        requested: u32,
        /// Tenant's tier maximum.
        max: u32,
    },
    /// `horizon` exceeded the tenant's tier maximum.
    #[error("horizon {requested} exceeds tier maximum {max}")]
    HorizonTooLarge {
        /// Requested horizon.
        requested: u32,
        /// Tenant's tier maximum.
        max: u32,
    },
    /// The reservation would exceed the tenant's budget cap.
    #[error("budget exhausted: {0:?}")]
    BudgetExhausted(Vec<BudgetKind>),
    /// A downstream dependency was unavailable past the admission timeout.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<TenantResolverError> for AdmissionError {
    fn from(err: TenantResolverError) -> Self {
        match err {
            TenantResolverError::Unknown(msg) => Self::TenantUnknown(msg),
            TenantResolverError::Unavailable(msg) => Self::ServiceUnavailable(msg),
        }
    }
}

impl From<IdempotencyError> for AdmissionError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Unavailable(msg) => Self::ServiceUnavailable(msg),
            IdempotencyError::AlreadyBound { .. } => {
                Self::ServiceUnavailable("idempotency race on insert".to_string())
            }
        }
    }
}

impl From<BudgetError> for AdmissionError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::Exhausted { limiting_kinds, .. } => Self::BudgetExhausted(limiting_kinds),
            other => Self::ServiceUnavailable(other.to_string()),
        }
    }
}

impl From<RegistryError> for AdmissionError {
    fn from(err: RegistryError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

impl From<SchedulerError> for AdmissionError {
    fn from(err: SchedulerError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

// ============================================================================
// SECTION: Request / Response
// ============================================================================

/// A submit-run request, validated and admitted by [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Tenant identifier, redundant with auth but must match.
    pub tenant_id: TenantId,
    /// Caller-supplied deduplication key.
    pub idempotency_key: IdempotencyKey,
    /// Free-text business goal.
    pub goal: String,
    /// Requested forecast horizon.
    pub horizon: u32,
    /// Requested scenario count.
    pub num_scenarios: u32,
}

/// The outcome of a successful admission call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// The run id the caller should poll.
    pub run_id: RunId,
    /// Present (and equal to `run_id`) when this call returned an existing
    /// run rather than creating a new one.
    pub duplicate_of: Option<RunId>,
}

// ============================================================================
// SECTION: Controller
// ============================================================================

/// Validates, de-duplicates, reserves budget for, and enqueues run requests.
pub struct AdmissionController {
    resolver: Arc<dyn TenantResolver>,
    idempotency: Arc<dyn IdempotencyIndex>,
    budget: Arc<dyn BudgetAccountant>,
    registry: Arc<dyn RunRegistry>,
    scheduler: Arc<WfqScheduler>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Builds a controller from its five injected collaborators.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn TenantResolver>,
        idempotency: Arc<dyn IdempotencyIndex>,
        budget: Arc<dyn BudgetAccountant>,
        registry: Arc<dyn RunRegistry>,
        scheduler: Arc<WfqScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { resolver, idempotency, budget, registry, scheduler, clock }
    }

    /// Runs the full seven-step admission flow.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when any step fails; no run is created in
    /// that case.
    pub fn admit(&self, request: &SubmitRequest) -> Result<AdmissionOutcome, AdmissionError> {
        // Step 1: resolve tenant and tier.
        let tenant = self.resolver.resolve(request.tenant_id.as_str())?;

        // Step 2: validate request shape and size limits.
        if request.goal.len() > MAX_GOAL_BYTES {
            return Err(AdmissionError::GoalTooLarge);
        }
        if request.idempotency_key.as_str().len() > MAX_IDEMPOTENCY_KEY_BYTES {
            return Err(AdmissionError::IdempotencyKeyTooLarge);
        }
        if request.num_scenarios > tenant.profile.caps.max_scenarios {
            return Err(AdmissionError::TooManyScenarios {
                requested: request.num_scenarios,
                max: tenant.profile.caps.max_scenarios,
            });
        }
        if request.horizon > tenant.profile.caps.max_horizon {
            return Err(AdmissionError::HorizonTooLarge {
                requested: request.horizon,
                max: tenant.profile.caps.max_horizon,
            });
        }

        let now = self.clock.now_unix_millis();

        // Step 3: idempotency check, strict for the full TTL window.
        if let Some(existing) =
            self.idempotency.lookup(&request.tenant_id, &request.idempotency_key, now)?
        {
            return Ok(AdmissionOutcome {
                run_id: existing.run_id.clone(),
                duplicate_of: Some(existing.run_id),
            });
        }

        // Step 4: derive the run's fixed seed.
        let seed = derive_seed(request.tenant_id.as_str(), request.idempotency_key.as_str(), SEED_SALT);

        // Step 5: estimate a cost vector from request size and tier profile.
        let cost = estimate_cost(request, &tenant.profile);

        // Step 6: reserve budget; rejection creates no run.
        let period = billing_period(now);
        let run_id = RunId::new(format!("run-{now}-{}", self.clock.next_id()));
        let reservation_id = self.budget.reserve(&request.tenant_id, &run_id, &period, cost, now)?;

        // Step 7: create the run, insert the idempotency record, and enqueue.
        let mut run = Run::new(
            run_id.clone(),
            request.tenant_id.clone(),
            tenant.profile.tier,
            request.goal.clone(),
            seed,
            request.idempotency_key.clone(),
            now,
        );
        run.budget_reservation = Some(reservation_id);
        self.registry.create_run(run)?;

        let record = new_record(
            request.tenant_id.clone(),
            request.idempotency_key.clone(),
            run_id.clone(),
            now,
            DEFAULT_TTL_MS,
        );
        self.idempotency.insert(record)?;

        self.scheduler.enqueue(
            run_id.clone(),
            request.tenant_id.clone(),
            tenant.profile.weight,
            tenant.profile.caps.max_parallel_runs,
            1.0,
            now,
        )?;

        Ok(AdmissionOutcome { run_id, duplicate_of: None })
    }
}

/// Estimates a resource cost vector from request size and tier profile.
fn estimate_cost(request: &SubmitRequest, profile: &crate::model::TenantProfile) -> CostVector {
    let scenario_factor = f64::from(request.num_scenarios.max(1));
    let horizon_factor = f64::from(request.horizon.max(1));
    CostVector {
        solver_sec: (scenario_factor * horizon_factor * 0.05).min(profile.caps.budget.solver_sec),
        llm_tokens: (request.goal.len() as f64 * 2.0).min(profile.caps.budget.llm_tokens),
        gpu_sec: (scenario_factor * 0.02).min(profile.caps.budget.gpu_sec),
    }
}

/// Derives a `"YYYY-MM"` billing period key from a Unix-millis timestamp.
fn billing_period(unix_millis: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(unix_millis.div_euclid(1000))
        .map(|dt| format!("{:04}-{:02}", dt.year(), u8::from(dt.month())))
        .unwrap_or_else(|_| "1970-01".to_string())
}
