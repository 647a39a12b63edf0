// dyocense-core/src/budget.rs
// ============================================================================
// Module: Budget Accountant
// Description: Per-tenant monthly resource counters with reserve/commit/release.
// Purpose: Enforce that committed+reserved never exceeds a tenant's cap.
// Dependencies: crate::{identifiers, model}
// ============================================================================

//! ## Overview
//! The Budget Accountant owns [`crate::model::BudgetLedgerEntry`] exclusively.
//! The ledger is append-only; totals are always computed by aggregation, not
//! in-place mutation, so [`totals_for`] is the single source of truth both the
//! in-memory fake and a durable backend must agree with.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::identifiers::ReservationId;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::model::BudgetKind;
use crate::model::BudgetLedgerEntry;
use crate::model::BudgetVector;
use crate::model::LedgerReason;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by a Budget Accountant backend.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// The requested reservation would push `committed + reserved` over the
    /// cap for at least one resource kind.
    #[error("budget exhausted for tenant {tenant_id}: {limiting_kinds:?}")]
    Exhausted {
        /// Tenant the reservation was attempted for.
        tenant_id: TenantId,
        /// Resource kinds whose cap would be exceeded.
        limiting_kinds: Vec<BudgetKind>,
    },
    /// The reservation was already resolved by a prior commit or release.
    #[error("reservation {0} already has a final outcome")]
    AlreadyResolved(ReservationId),
    /// No such reservation exists.
    #[error("reservation {0} not found")]
    NotFound(ReservationId),
    /// The backend is transiently unavailable.
    #[error("budget accountant unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// SECTION: Cost Vector
// ============================================================================

/// A resource cost estimate or measurement across the three tracked kinds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostVector {
    /// Solver-seconds component.
    pub solver_sec: f64,
    /// LLM tokens component.
    pub llm_tokens: f64,
    /// GPU-seconds component.
    pub gpu_sec: f64,
}

impl CostVector {
    /// Returns the value for a single resource kind.
    #[must_use]
    pub const fn component(&self, kind: BudgetKind) -> f64 {
        match kind {
            BudgetKind::SolverSec => self.solver_sec,
            BudgetKind::LlmTokens => self.llm_tokens,
            BudgetKind::GpuSec => self.gpu_sec,
        }
    }

    /// Iterates `(kind, value)` pairs over all three components.
    pub fn components(&self) -> [(BudgetKind, f64); 3] {
        [
            (BudgetKind::SolverSec, self.solver_sec),
            (BudgetKind::LlmTokens, self.llm_tokens),
            (BudgetKind::GpuSec, self.gpu_sec),
        ]
    }
}

/// Soft-alert threshold: 80% of cap, per the Budget Accountant's alerting rule.
pub const SOFT_ALERT_RATIO: f64 = 0.8;

// ============================================================================
// SECTION: Report
// ============================================================================

/// Point-in-time view of a tenant's consumption against its cap, returned by
/// `query`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetReport {
    /// Resource kind this report line describes.
    pub kind: BudgetKind,
    /// Sum of all `commit` postings.
    pub committed: f64,
    /// Sum of outstanding `reserve` postings not yet committed or released.
    pub reserved: f64,
    /// Cap for this tenant and period.
    pub cap: f64,
    /// Whether `committed + reserved` has crossed [`SOFT_ALERT_RATIO`].
    pub soft_alert: bool,
}

impl BudgetReport {
    /// Remaining headroom before the cap is reached.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        (self.cap - self.committed - self.reserved).max(0.0)
    }
}

/// Aggregates a tenant/period's ledger entries for one resource kind into a
/// [`BudgetReport`]. Both the in-memory fake and a durable backend must
/// compute totals this way, never by in-place mutation.
#[must_use]
pub fn totals_for(entries: &[BudgetLedgerEntry], kind: BudgetKind, cap: f64) -> BudgetReport {
    let mut committed = 0.0;
    let mut reserved_by_reservation: std::collections::HashMap<&str, f64> =
        std::collections::HashMap::new();

    for entry in entries.iter().filter(|e| e.kind == kind) {
        match entry.reason {
            LedgerReason::Reserve => {
                *reserved_by_reservation.entry(entry.reservation_id.as_str()).or_insert(0.0) +=
                    entry.delta;
            }
            LedgerReason::Commit => {
                committed += entry.delta;
                *reserved_by_reservation.entry(entry.reservation_id.as_str()).or_insert(0.0) -=
                    entry.delta;
            }
            LedgerReason::Release | LedgerReason::Refund => {
                *reserved_by_reservation.entry(entry.reservation_id.as_str()).or_insert(0.0) -=
                    entry.delta.abs();
            }
        }
    }

    let reserved = reserved_by_reservation.values().sum::<f64>().max(0.0);
    let soft_alert = cap > 0.0 && (committed + reserved) / cap >= SOFT_ALERT_RATIO;

    BudgetReport { kind, committed, reserved, cap, soft_alert }
}

/// Determines which resource kinds a reservation of `requested` would push
/// over `cap` given the tenant's current `reports`.
#[must_use]
pub fn limiting_kinds(reports: &[BudgetReport], requested: &CostVector) -> Vec<BudgetKind> {
    reports
        .iter()
        .filter(|report| report.committed + report.reserved + requested.component(report.kind) > report.cap)
        .map(|report| report.kind)
        .collect()
}

/// Builds the three reserve-reason ledger entries for a new reservation.
#[must_use]
pub fn reserve_entries(
    tenant_id: TenantId,
    period: String,
    reservation_id: ReservationId,
    run_id: RunId,
    cost: CostVector,
    ts: i64,
) -> Vec<BudgetLedgerEntry> {
    cost.components()
        .into_iter()
        .filter(|(_, value)| *value > 0.0)
        .map(|(kind, value)| BudgetLedgerEntry {
            tenant_id: tenant_id.clone(),
            period: period.clone(),
            kind,
            delta: value,
            reason: LedgerReason::Reserve,
            reservation_id: reservation_id.clone(),
            run_id: run_id.clone(),
            ts,
        })
        .collect()
}

/// Trait satisfied by any tenant cap resolver the accountant consults when
/// computing `limiting_kinds`.
pub trait CapResolver: Send + Sync {
    /// Returns the tenant's budget cap vector for the given period.
    fn cap_for(&self, tenant_id: &TenantId, period: &str) -> BudgetVector;
}

/// Durable or in-memory backend for the append-only budget ledger.
pub trait BudgetAccountant: Send + Sync {
    /// Reserves `cost` against `tenant_id`'s cap for `period`, returning a
    /// fresh reservation id on success.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Exhausted`] when any component would exceed the
    /// cap, or [`BudgetError::Unavailable`] on a backend error.
    fn reserve(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        period: &str,
        cost: CostVector,
        ts: i64,
    ) -> Result<ReservationId, BudgetError>;

    /// Commits measured usage against a reservation, refunding any unused
    /// portion.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::NotFound`] or [`BudgetError::AlreadyResolved`]
    /// when the reservation cannot be committed, or
    /// [`BudgetError::Unavailable`] on a backend error.
    fn commit(&self, reservation_id: &ReservationId, actual: CostVector, ts: i64) -> Result<(), BudgetError>;

    /// Releases a reservation in full, before any commit.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::NotFound`] or [`BudgetError::AlreadyResolved`]
    /// when the reservation cannot be released, or
    /// [`BudgetError::Unavailable`] on a backend error.
    fn release(&self, reservation_id: &ReservationId, ts: i64) -> Result<(), BudgetError>;

    /// Returns the current consumption and reservation report for a tenant
    /// and period, one line per resource kind.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Unavailable`] on a backend error.
    fn query(&self, tenant_id: &TenantId, period: &str) -> Result<Vec<BudgetReport>, BudgetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: BudgetKind, delta: f64, reason: LedgerReason, reservation: &str) -> BudgetLedgerEntry {
        BudgetLedgerEntry {
            tenant_id: TenantId::new("t1"),
            period: "2026-08".to_string(),
            kind,
            delta,
            reason,
            reservation_id: ReservationId::new(reservation),
            run_id: RunId::new("r1"),
            ts: 0,
        }
    }

    #[test]
    fn totals_aggregate_reserve_then_commit_with_refund() {
        let entries = vec![
            entry(BudgetKind::SolverSec, 10.0, LedgerReason::Reserve, "res1"),
            entry(BudgetKind::SolverSec, 6.0, LedgerReason::Commit, "res1"),
            entry(BudgetKind::SolverSec, 4.0, LedgerReason::Refund, "res1"),
        ];
        let report = totals_for(&entries, BudgetKind::SolverSec, 100.0);
        assert_eq!(report.committed, 6.0);
        assert_eq!(report.reserved, 0.0);
    }

    #[test]
    fn reservation_exactly_at_cap_is_not_limiting() {
        let reports = vec![BudgetReport {
            kind: BudgetKind::SolverSec,
            committed: 0.0,
            reserved: 90.0,
            cap: 100.0,
            soft_alert: false,
        }];
        let requested = CostVector { solver_sec: 10.0, ..CostVector::default() };
        assert!(limiting_kinds(&reports, &requested).is_empty());
    }

    #[test]
    fn reservation_one_unit_over_cap_is_limiting() {
        let reports = vec![BudgetReport {
            kind: BudgetKind::SolverSec,
            committed: 0.0,
            reserved: 90.0,
            cap: 100.0,
            soft_alert: false,
        }];
        let requested = CostVector { solver_sec: 10.001, ..CostVector::default() };
        assert_eq!(limiting_kinds(&reports, &requested), vec![BudgetKind::SolverSec]);
    }

    #[test]
    fn soft_alert_trips_at_eighty_percent() {
        let entries = vec![entry(BudgetKind::LlmTokens, 80.0, LedgerReason::Commit, "res1")];
        let report = totals_for(&entries, BudgetKind::LlmTokens, 100.0);
        assert!(report.soft_alert);
    }
}
