// dyocense-store-sqlite/src/lib.rs
// ============================================================================
// Module: Dyocense SQLite Store
// Description: Durable RunRegistry/IdempotencyIndex/BudgetAccountant and a
//              content-addressed filesystem EvidenceStore.
// Purpose: Give the Decision Kernel a production-grade persistence backend.
// Dependencies: dyocense-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides the durable backends the Decision Kernel's traits
//! describe but do not implement: [`store::SqliteKernelStore`] persists
//! runs, stage records, the idempotency index, and the budget ledger in a
//! single `SQLite` database, and [`evidence::FsEvidenceStore`] persists
//! provenance graphs and blobs as content-addressed files. Security
//! posture: all inputs read back from either backend are treated as
//! untrusted and re-verified against their stored hash before use.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod connection;
pub mod error;
pub mod evidence;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use connection::SqliteSyncMode;
pub use error::SqliteStoreError;
pub use evidence::FsEvidenceStore;
pub use evidence::FsEvidenceStoreConfig;
pub use store::SqliteKernelStore;
pub use store::SqliteKernelStoreConfig;
