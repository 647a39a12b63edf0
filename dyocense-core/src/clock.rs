// dyocense-core/src/clock.rs
// ============================================================================
// Module: Clock & IDGen
// Description: Injected time source and identifier/seed generation.
// Purpose: Keep the engine's decisions deterministic and replayable.
// Dependencies: time, rand
// ============================================================================

//! ## Overview
//! The engine never reads the wall clock or a random generator directly — a
//! host supplies both through [`Clock`], the same discipline the grounding
//! codebase applies to its `Timestamp` values. Tests inject a [`FixedClock`]
//! or a manually-advanced stepped clock to make dispatch order and timeout
//! behavior reproducible.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use sha2::Digest;
use sha2::Sha256;

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Monotonic time source and identifier generator injected into every
/// component that would otherwise need ambient access to wall-clock time or
/// randomness.
pub trait Clock: Send + Sync {
    /// Returns the current time as Unix milliseconds.
    fn now_unix_millis(&self) -> i64;

    /// Returns a fresh, process-unique identifier suffix.
    fn next_id(&self) -> u64;
}

/// Derives a deterministic run seed from a tenant, an idempotency key, and a
/// fixed salt, per the admission flow's seed-derivation step.
#[must_use]
pub fn derive_seed(tenant_id: &str, idempotency_key: &str, salt: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(idempotency_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}

// ============================================================================
// SECTION: System Clock
// ============================================================================

/// Wall-clock [`Clock`] backed by [`std::time::SystemTime`] and an atomic
/// counter for identifier uniqueness within the process.
#[derive(Debug, Default)]
pub struct SystemClock {
    counter: AtomicU64,
}

impl SystemClock {
    /// Creates a new system clock with its counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }
}

impl Clock for SystemClock {
    fn now_unix_millis(&self) -> i64 {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        #[allow(
            clippy::cast_possible_truncation,
            reason = "milliseconds since epoch fits i64 until year 292476952"
        )]
        let millis = duration.as_millis() as i64;
        millis
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// SECTION: Fixed Clock (test double)
// ============================================================================

/// Deterministic [`Clock`] used by tests: time is set explicitly and only
/// ever advances when the test advances it.
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
    counter: AtomicU64,
}

impl FixedClock {
    /// Creates a clock starting at the given Unix-millis timestamp.
    #[must_use]
    pub const fn at(millis: i64) -> Self {
        Self { millis: AtomicI64::new(millis), counter: AtomicU64::new(0) }
    }

    /// Advances the clock by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_unix_millis(&self) -> i64 {
        self.millis.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_seed_is_deterministic_and_key_sensitive() {
        let a = derive_seed("tenant-1", "key-1", "salt");
        let b = derive_seed("tenant-1", "key-1", "salt");
        let c = derive_seed("tenant-1", "key-2", "salt");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fixed_clock_only_advances_when_told() {
        let clock = FixedClock::at(1_000);
        assert_eq!(clock.now_unix_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_unix_millis(), 1_500);
    }

    #[test]
    fn fixed_clock_ids_are_unique_and_increasing() {
        let clock = FixedClock::at(0);
        let a = clock.next_id();
        let b = clock.next_id();
        assert!(b > a);
    }
}
