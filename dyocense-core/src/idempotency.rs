// dyocense-core/src/idempotency.rs
// ============================================================================
// Module: Idempotency Index
// Description: (tenant, idempotency_key) -> run_id mapping with TTL.
// Purpose: Guarantee duplicate submissions within the TTL window never
//          create a second run.
// Dependencies: crate::{identifiers, model}
// ============================================================================

//! ## Overview
//! The Idempotency Index owns [`crate::model::IdempotencyRecord`] values
//! exclusively. Admission consults it before creating a run and inserts a new
//! record immediately after; no other component writes to it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::identifiers::IdempotencyKey;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::model::IdempotencyRecord;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by an Idempotency Index backend.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// A record already exists for this `(tenant_id, key)` and has not
    /// expired; inserting again would violate the index's uniqueness
    /// invariant.
    #[error("idempotency key already bound to run {existing_run_id}")]
    AlreadyBound {
        /// Run id the key is already bound to.
        existing_run_id: RunId,
    },
    /// The backend is transiently unavailable.
    #[error("idempotency index unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Default idempotency TTL in milliseconds (24 hours), per the admission
/// flow's default and spec Open Question (c).
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Durable or in-memory backend for the `(tenant, key) -> run_id` mapping.
pub trait IdempotencyIndex: Send + Sync {
    /// Looks up a non-expired record for `(tenant_id, key)` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Unavailable`] when the backend cannot be
    /// reached.
    fn lookup(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
        now: i64,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Inserts a new record with `expires_at = created_at + ttl_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::AlreadyBound`] when a non-expired record
    /// already exists for `(tenant_id, key)`, or
    /// [`IdempotencyError::Unavailable`] on a backend error.
    fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError>;

    /// Removes all records for a tenant, honoring an explicit purge request.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Unavailable`] on a backend error.
    fn purge_tenant(&self, tenant_id: &TenantId) -> Result<(), IdempotencyError>;
}

/// Builds the record Admission inserts after creating a run.
#[must_use]
pub fn new_record(
    tenant_id: TenantId,
    key: IdempotencyKey,
    run_id: RunId,
    created_at: i64,
    ttl_ms: i64,
) -> IdempotencyRecord {
    IdempotencyRecord { tenant_id, key, run_id, created_at, expires_at: created_at + ttl_ms }
}

/// Returns whether a record is still valid at `now`.
#[must_use]
pub fn is_live(record: &IdempotencyRecord, now: i64) -> bool {
    now < record.expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expires_at_created_plus_ttl() {
        let record =
            new_record(TenantId::new("t1"), IdempotencyKey::new("k1"), RunId::new("r1"), 1_000, DEFAULT_TTL_MS);
        assert_eq!(record.expires_at, 1_000 + DEFAULT_TTL_MS);
    }

    #[test]
    fn is_live_respects_expiry_boundary() {
        let record = new_record(TenantId::new("t1"), IdempotencyKey::new("k1"), RunId::new("r1"), 0, 1_000);
        assert!(is_live(&record, 999));
        assert!(!is_live(&record, 1_000));
    }
}
