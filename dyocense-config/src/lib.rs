// dyocense-config/src/lib.rs
// ============================================================================
// Module: Dyocense Config Library
// Description: Canonical configuration model and fail-closed validation.
// Purpose: Single source of truth for dyocense.toml semantics.
// Dependencies: dyocense-core, serde, toml
// ============================================================================

//! ## Overview
//! `dyocense-config` defines the configuration model for the Decision
//! Kernel: tenancy tier defaults, scheduler parameters, idempotency TTL,
//! and storage/evidence backend selection. Loading is strict and
//! fail-closed: unknown or invalid settings are rejected rather than
//! silently coerced into an under-provisioned default.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
