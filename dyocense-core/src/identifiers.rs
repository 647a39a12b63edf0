// dyocense-core/src/identifiers.rs
// ============================================================================
// Module: Kernel Identifiers
// Description: Newtype identifiers shared across the orchestrator's components.
// Purpose: Prevent cross-identifier mixups (tenant vs. run vs. reservation).
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every externally visible identifier is a distinct newtype over `String`
//! rather than a bare `String`, so a tenant id can never be passed where a
//! run id is expected and the compiler catches the mistake.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Macro
// ============================================================================

/// Defines a `String`-backed newtype identifier with the shared accessor set.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Tenant identifier, resolved by the external identity resolver.
    TenantId
);

string_id!(
    /// Globally unique, immutable run identifier.
    RunId
);

string_id!(
    /// Client-supplied idempotency key, scoped per tenant.
    IdempotencyKey
);

string_id!(
    /// Budget reservation identifier returned by `reserve`.
    ReservationId
);

string_id!(
    /// Pinned code version for a stage adapter implementation.
    CodeVersion
);

string_id!(
    /// Stable identifier for an evidence node (Goal, Constraint, Scenario, ...).
    EvidenceNodeId
);

string_id!(
    /// Content-addressed reference to a stored artifact (sha256 hex digest).
    ContentRef
);

// ============================================================================
// SECTION: Stage Name
// ============================================================================

/// Fixed stage identifiers in the pipeline DAG.
///
/// # Invariants
/// - The ordering below is the canonical linear order used for DAG-prefix
///   checks; `Diagnose` is reachable only from `Optimise` on `infeasible`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Translate a goal and inputs into the canonical OPS intermediate representation.
    Compile,
    /// Produce a scenario set and demand/lead-time statistics.
    Forecast,
    /// Evaluate governance constraints against the compiled OPS and forecast.
    Policy,
    /// Solve the optimization problem and produce a solution pack.
    Optimise,
    /// Produce advisory relaxation suggestions after an infeasible solve.
    Diagnose,
    /// Produce a natural-language narrative for the run's outcome.
    Explain,
    /// Persist the run's provenance graph to the evidence store.
    Evidence,
}

impl StageName {
    /// Returns the canonical stage order used for DAG-prefix validation.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Compile => 0,
            Self::Forecast => 1,
            Self::Policy => 2,
            Self::Optimise => 3,
            Self::Diagnose => 4,
            Self::Explain => 5,
            Self::Evidence => 6,
        }
    }

    /// Returns the stable string form used in API payloads and fingerprints.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Forecast => "forecast",
            Self::Policy => "policy",
            Self::Optimise => "optimise",
            Self::Diagnose => "diagnose",
            Self::Explain => "explain",
            Self::Evidence => "evidence",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
