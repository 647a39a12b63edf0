// dyocense-core/src/fingerprint.rs
// ============================================================================
// Module: Fingerprint Hasher
// Description: Canonical JSON hashing for model fingerprints and plan DNA.
// Purpose: Deterministic, platform-independent content addressing of stage I/O.
// Dependencies: serde, serde_json, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Fingerprints are content hashes of canonicalized JSON: keys sorted
//! lexicographically, numbers rendered in a single canonical form, strings
//! byte-identical. [RFC 8785] JSON Canonicalization is used for the
//! byte-serialization step; this module adds the volatile-field stripping
//! and composite-fingerprint assembly needed on top of it.
//!
//! [RFC 8785]: https://www.rfc-editor.org/rfc/rfc8785

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while canonicalizing or hashing a value.
#[derive(Debug, Error)]
pub enum HashError {
    /// The value could not be canonicalized to JCS bytes.
    #[error("fingerprint canonicalization failed: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Hash Digest
// ============================================================================

/// Hash algorithm used to produce a [`HashDigest`].
///
/// # Invariants
/// - `Sha256` is the only algorithm today; the enum exists so a future
///   algorithm addition does not change the `HashDigest` wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
}

/// Default hash algorithm for all fingerprints.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

/// A hex-encoded digest tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct HashDigest {
    /// Algorithm used to compute `value`.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Builds a digest from raw bytes using the given algorithm.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => {
                let digest = Sha256::digest(bytes);
                Self { algorithm, value: hex_encode(&digest) }
            }
        }
    }
}

impl std::fmt::Display for HashDigest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.value)
    }
}

/// Hex-encodes bytes without pulling in an external crate for this one use.
fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ============================================================================
// SECTION: Canonicalization
// ============================================================================

/// Serializes `value` to RFC 8785 JSON Canonicalization Scheme bytes.
///
/// JCS sorts object keys lexicographically by UTF-16 code unit and renders
/// numbers via the ECMAScript `Number::toString` algorithm, which already
/// yields `-0 -> "0"`, no trailing fractional zeros, and the shortest
/// round-trippable decimal representation of the underlying IEEE-754
/// double — exactly the numeric-normalization properties a stable content
/// hash requires.
///
/// # Errors
///
/// Returns [`HashError`] when `value` cannot be serialized.
pub fn canonical_json_bytes<T>(value: &T) -> Result<Vec<u8>, HashError>
where
    T: Serialize + ?Sized,
{
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Canonicalizes and hashes `value` with the given algorithm.
///
/// # Errors
///
/// Returns [`HashError`] when `value` cannot be canonicalized.
pub fn hash_canonical_json<T>(algorithm: HashAlgorithm, value: &T) -> Result<HashDigest, HashError>
where
    T: Serialize + ?Sized,
{
    let bytes = canonical_json_bytes(value)?;
    Ok(HashDigest::new(algorithm, &bytes))
}

/// Hashes raw bytes directly (used for content-addressed evidence snapshots).
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> HashDigest {
    HashDigest::new(algorithm, bytes)
}

// ============================================================================
// SECTION: Volatile Field Stripping
// ============================================================================

/// Removes volatile top-level object keys from a JSON value before hashing.
///
/// Volatile fields (wall-clock timestamps, solver build identifiers, and
/// similar) must not affect a stage's fingerprint: two runs with identical
/// semantic input and a different wall-clock timestamp must fingerprint
/// identically. Only top-level keys are stripped; nested objects are left
/// untouched, matching a flat volatile-field set.
#[must_use]
pub fn strip_volatile_fields(value: &Value, volatile_fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut pruned = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if volatile_fields.contains(&key.as_str()) {
                    continue;
                }
                pruned.insert(key.clone(), inner.clone());
            }
            Value::Object(pruned)
        }
        other => other.clone(),
    }
}

/// Default volatile fields stripped from stage outputs before fingerprinting.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] =
    &["timestamp", "wall_clock_ms", "solver_build_id", "started_at", "ended_at"];

// ============================================================================
// SECTION: Model Fingerprint / Plan DNA
// ============================================================================

/// Computes the model fingerprint of an OPS document.
///
/// `ops` is canonicalized after stripping `volatile_fields` from its
/// top level, then hashed with [`DEFAULT_HASH_ALGORITHM`].
///
/// # Errors
///
/// Returns [`HashError`] when `ops` cannot be canonicalized.
pub fn model_fingerprint(ops: &Value, volatile_fields: &[&str]) -> Result<HashDigest, HashError> {
    let pruned = strip_volatile_fields(ops, volatile_fields);
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, &pruned)
}

/// Composite inputs folded into a run's plan DNA fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDnaInputs<'a> {
    /// Fingerprint of the compiled OPS document.
    pub ops_fingerprint: &'a str,
    /// Fingerprint of the forecast scenario set.
    pub scenarios_fingerprint: &'a str,
    /// The policy snapshot applied to the run.
    pub policy_snapshot: &'a Value,
    /// The chosen solution's decision variables.
    pub solution_decisions: &'a Value,
}

/// Computes a run's plan DNA from its stage fingerprints and decisions.
///
/// # Errors
///
/// Returns [`HashError`] when the composite value cannot be canonicalized.
pub fn plan_dna(inputs: &PlanDnaInputs<'_>) -> Result<HashDigest, HashError> {
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, inputs)
}
