// dyocense-store-sqlite/src/error.rs
// ============================================================================
// Module: SQLite Store Errors
// Description: Shared error taxonomy for every durable backend in this crate.
// Purpose: One error type, converted into each trait's own error at the seam.
// Dependencies: dyocense-core, thiserror
// ============================================================================

//! ## Overview
//! Every backend in this crate raises [`SqliteStoreError`] internally, then
//! converts it into the trait-specific error ([`dyocense_core::registry::RegistryError`],
//! [`dyocense_core::idempotency::IdempotencyError`],
//! [`dyocense_core::budget::BudgetError`], or
//! [`dyocense_core::evidence::EvidenceStoreError`]) at the public boundary.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Error
// ============================================================================

/// Errors raised by a durable backend in this crate.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Filesystem I/O failure.
    #[error("store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("store db error: {0}")]
    Db(String),
    /// Stored data failed its integrity check on read-back.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Stored schema version does not match this build.
    #[error("store schema version mismatch: {0}")]
    VersionMismatch(String),
    /// Caller-supplied or stored data was invalid.
    #[error("store invalid data: {0}")]
    Invalid(String),
    /// No record exists for the requested key.
    #[error("store record not found: {0}")]
    NotFound(String),
    /// The requested mutation conflicts with an existing, resolved record.
    #[error("store conflict: {0}")]
    Conflict(String),
}
