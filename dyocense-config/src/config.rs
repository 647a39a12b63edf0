// dyocense-config/src/config.rs
// ============================================================================
// Module: Dyocense Kernel Configuration
// Description: Configuration loading and validation for the Decision Kernel.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: dyocense-core, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path
//! limits. Missing or invalid configuration fails closed: a tenant tier
//! with no caps, or a store backend with no connection settings, is a
//! load-time error rather than a runtime surprise.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use dyocense_core::model::BudgetVector;
use dyocense_core::model::StageTimeouts;
use dyocense_core::model::TenantCaps;
use dyocense_core::model::Tier;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "dyocense.toml";
/// Environment variable used to override the config path.
pub(crate) const CONFIG_ENV_VAR: &str = "DYOCENSE_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Default idempotency record TTL in milliseconds (24 hours).
pub(crate) const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = 24 * 60 * 60 * 1000;
/// Minimum allowed idempotency TTL in milliseconds (5 minutes).
pub(crate) const MIN_IDEMPOTENCY_TTL_MS: u64 = 5 * 60 * 1000;
/// Maximum allowed idempotency TTL in milliseconds (30 days).
pub(crate) const MAX_IDEMPOTENCY_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;
/// Default admission queue timeout in milliseconds.
pub(crate) const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 2_000;
/// Minimum allowed admission queue timeout in milliseconds.
pub(crate) const MIN_ADMISSION_TIMEOUT_MS: u64 = 100;
/// Maximum allowed admission queue timeout in milliseconds.
pub(crate) const MAX_ADMISSION_TIMEOUT_MS: u64 = 60_000;
/// Default evidence write attempt budget, matching the evidence module.
pub(crate) const DEFAULT_EVIDENCE_MAX_ATTEMPTS: u32 = 5;
/// Maximum evidence write attempt budget accepted in configuration.
pub(crate) const MAX_EVIDENCE_MAX_ATTEMPTS: u32 = 20;
/// Default evidence retry backoff base in milliseconds.
pub(crate) const DEFAULT_EVIDENCE_BACKOFF_BASE_MS: u64 = 50;
/// Default evidence retry backoff cap in milliseconds.
pub(crate) const DEFAULT_EVIDENCE_BACKOFF_CAP_MS: u64 = 2_000;
/// Default `SQLite` busy-wait timeout in milliseconds.
pub(crate) const DEFAULT_SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Root Configuration
// ============================================================================

/// Root configuration for a Decision Kernel host process.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    /// Per-tier tenant defaults, keyed by tier name.
    pub tenancy: TenancyConfig,
    /// Scheduler worker pool and admission parameters.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Idempotency record lifetime.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Durable storage backend selection.
    pub store: StoreConfig,
    /// Evidence store root and retry policy.
    pub evidence: EvidenceConfig,
    /// Optional config source metadata (not serialized).
    #[serde(skip)]
    pub source_modified_at: Option<SystemTime>,
}

impl KernelConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let mut config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.source_modified_at = fs::metadata(&resolved).and_then(|meta| meta.modified()).ok();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.tenancy.validate()?;
        self.scheduler.validate()?;
        self.idempotency.validate()?;
        self.store.validate()?;
        self.evidence.validate()?;
        Ok(())
    }

    /// Resolves the tenant caps configured for a tier, if present.
    #[must_use]
    pub fn caps_for(&self, tier: Tier) -> Option<TenantCaps> {
        self.tenancy.tiers.get(&tier).map(TierDefaults::to_caps)
    }

    /// Resolves the WFQ weight configured for a tier, if present.
    #[must_use]
    pub fn weight_for(&self, tier: Tier) -> Option<f64> {
        self.tenancy.tiers.get(&tier).map(|tier_defaults| tier_defaults.weight)
    }
}

// ============================================================================
// SECTION: Tenancy
// ============================================================================

/// Default tier caps and weights, used when no live tenant resolver
/// override is supplied.
#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
    /// Tier name to tier defaults.
    pub tiers: BTreeMap<Tier, TierDefaults>,
}

impl TenancyConfig {
    /// Validates that every tier carries sane, non-degenerate caps.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Invalid(
                "tenancy.tiers must define at least one tier".to_string(),
            ));
        }
        for (tier, defaults) in &self.tiers {
            defaults.validate(*tier)?;
        }
        Ok(())
    }
}

/// Per-tier defaults: concurrency/scenario caps, stage timeouts, solver
/// gap floor, monthly budget vector, and WFQ weight.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierDefaults {
    /// Maximum concurrently running runs for a tenant on this tier.
    pub max_parallel_runs: u32,
    /// Maximum scenarios a single Forecast stage may request.
    pub max_scenarios: u32,
    /// Maximum horizon (periods) a single Forecast stage may request.
    pub max_horizon: u32,
    /// Per-stage wall-clock timeout table.
    pub stage_timeouts: StageTimeouts,
    /// Floor on the optimality gap a solver may accept.
    pub mip_gap_floor: f64,
    /// Monthly budget cap vector.
    pub budget: BudgetVector,
    /// WFQ weight (`w_t`) applied to this tier's runs.
    pub weight: f64,
}

impl TierDefaults {
    /// Validates a single tier's defaults.
    fn validate(&self, tier: Tier) -> Result<(), ConfigError> {
        if self.max_parallel_runs == 0 {
            return Err(ConfigError::Invalid(format!(
                "tenancy.tiers.{tier:?}.max_parallel_runs must be greater than zero"
            )));
        }
        if self.max_scenarios == 0 {
            return Err(ConfigError::Invalid(format!(
                "tenancy.tiers.{tier:?}.max_scenarios must be greater than zero"
            )));
        }
        if self.max_horizon == 0 {
            return Err(ConfigError::Invalid(format!(
                "tenancy.tiers.{tier:?}.max_horizon must be greater than zero"
            )));
        }
        if !(0.0..1.0).contains(&self.mip_gap_floor) {
            return Err(ConfigError::Invalid(format!(
                "tenancy.tiers.{tier:?}.mip_gap_floor must be in [0, 1)"
            )));
        }
        if self.weight <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "tenancy.tiers.{tier:?}.weight must be greater than zero"
            )));
        }
        for (field, value) in [
            ("compile_ms", self.stage_timeouts.compile_ms),
            ("forecast_ms", self.stage_timeouts.forecast_ms),
            ("policy_ms", self.stage_timeouts.policy_ms),
            ("optimise_ms", self.stage_timeouts.optimise_ms),
            ("diagnose_ms", self.stage_timeouts.diagnose_ms),
            ("explain_ms", self.stage_timeouts.explain_ms),
            ("evidence_ms", self.stage_timeouts.evidence_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tenancy.tiers.{tier:?}.stage_timeouts.{field} must be greater than zero"
                )));
            }
        }
        for (field, value) in [
            ("solver_sec", self.budget.solver_sec),
            ("llm_tokens", self.budget.llm_tokens),
            ("gpu_sec", self.budget.gpu_sec),
        ] {
            if value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tenancy.tiers.{tier:?}.budget.{field} must be non-negative"
                )));
            }
        }
        Ok(())
    }

    /// Builds the [`TenantCaps`] this tier resolves to.
    #[must_use]
    fn to_caps(&self) -> TenantCaps {
        TenantCaps {
            max_parallel_runs: self.max_parallel_runs,
            max_scenarios: self.max_scenarios,
            max_horizon: self.max_horizon,
            stage_timeouts: self.stage_timeouts,
            mip_gap_floor: self.mip_gap_floor,
            budget: self.budget,
        }
    }
}

// ============================================================================
// SECTION: Scheduler
// ============================================================================

/// Scheduler worker pool sizing and admission parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of pipeline worker threads. Zero means "use the host's
    /// available parallelism at startup".
    #[serde(default)]
    pub worker_pool_size: usize,
    /// Maximum time an admitted run may wait in queue before the
    /// admission timeout error is surfaced to the caller.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
    /// Salt mixed into tie-break ordering so that two kernels fed the
    /// same workload do not dispatch in lockstep.
    #[serde(default)]
    pub tie_break_salt: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            admission_timeout_ms: default_admission_timeout_ms(),
            tie_break_salt: 0,
        }
    }
}

impl SchedulerConfig {
    /// Validates scheduler configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout_range(
            "scheduler.admission_timeout_ms",
            self.admission_timeout_ms,
            MIN_ADMISSION_TIMEOUT_MS,
            MAX_ADMISSION_TIMEOUT_MS,
        )
    }

    /// Returns the configured worker pool size, falling back to the
    /// host's available parallelism when unset.
    #[must_use]
    pub fn resolved_worker_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            return self.worker_pool_size;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

/// Default admission queue timeout.
const fn default_admission_timeout_ms() -> u64 {
    DEFAULT_ADMISSION_TIMEOUT_MS
}

// ============================================================================
// SECTION: Idempotency
// ============================================================================

/// Idempotency record lifetime configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdempotencyConfig {
    /// Time-to-live for idempotency records, in milliseconds.
    #[serde(default = "default_idempotency_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_idempotency_ttl_ms(),
        }
    }
}

impl IdempotencyConfig {
    /// Validates idempotency TTL bounds.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout_range(
            "idempotency.ttl_ms",
            self.ttl_ms,
            MIN_IDEMPOTENCY_TTL_MS,
            MAX_IDEMPOTENCY_TTL_MS,
        )
    }
}

/// Default idempotency TTL.
const fn default_idempotency_ttl_ms() -> u64 {
    DEFAULT_IDEMPOTENCY_TTL_MS
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Durable storage backend selection for the Run Registry, Idempotency
/// Index, and Budget Ledger.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// `SQLite`-backed storage (WAL mode).
    Sqlite(SqliteStoreConfig),
}

impl StoreConfig {
    /// Validates store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Sqlite(config) => config.validate(),
        }
    }
}

/// `SQLite` connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Journal durability mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Busy-wait timeout before a locked-database error is returned.
    #[serde(default = "default_sqlite_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl SqliteStoreConfig {
    /// Validates `SQLite` connection settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_path_string("store.path", &self.path.to_string_lossy())?;
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default `SQLite` busy timeout.
const fn default_sqlite_busy_timeout_ms() -> u64 {
    DEFAULT_SQLITE_BUSY_TIMEOUT_MS
}

/// `SQLite` journal/synchronous durability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// `PRAGMA synchronous=FULL`: fsync on every commit.
    #[default]
    Full,
    /// `PRAGMA synchronous=NORMAL`: fsync at WAL checkpoints only.
    Normal,
}

// ============================================================================
// SECTION: Evidence
// ============================================================================

/// Evidence store root path and write retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceConfig {
    /// Filesystem root for content-addressed evidence blobs.
    pub root_path: PathBuf,
    /// Maximum write attempts before an evidence write is abandoned.
    #[serde(default = "default_evidence_max_attempts")]
    pub max_attempts: u32,
    /// Retry backoff base, in milliseconds.
    #[serde(default = "default_evidence_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry backoff cap, in milliseconds.
    #[serde(default = "default_evidence_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl EvidenceConfig {
    /// Validates evidence store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_path_string("evidence.root_path", &self.root_path.to_string_lossy())?;
        if self.max_attempts == 0 || self.max_attempts > MAX_EVIDENCE_MAX_ATTEMPTS {
            return Err(ConfigError::Invalid(format!(
                "evidence.max_attempts must be in 1..={MAX_EVIDENCE_MAX_ATTEMPTS}"
            )));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "evidence.backoff_base_ms must be greater than zero".to_string(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "evidence.backoff_cap_ms must be >= evidence.backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default evidence write attempt budget.
const fn default_evidence_max_attempts() -> u32 {
    DEFAULT_EVIDENCE_MAX_ATTEMPTS
}

/// Default evidence retry backoff base.
const fn default_evidence_backoff_base_ms() -> u64 {
    DEFAULT_EVIDENCE_BACKOFF_BASE_MS
}

/// Default evidence retry backoff cap.
const fn default_evidence_backoff_cap_ms() -> u64 {
    DEFAULT_EVIDENCE_BACKOFF_CAP_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    let path = Path::new(trimmed);
    for component in path.components() {
        let component_value = component.as_os_str().to_string_lossy();
        if component_value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates that a millisecond duration falls within an inclusive range.
fn validate_timeout_range(
    field: &str,
    value_ms: u64,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), ConfigError> {
    if value_ms < min_ms || value_ms > max_ms {
        return Err(ConfigError::Invalid(format!(
            "{field} must be between {min_ms} and {max_ms} milliseconds",
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test fixtures use explicit asserts and unwraps for clarity."
    )]

    use std::io::Write as _;

    use super::*;

    fn sample_toml() -> String {
        r#"
[tenancy.tiers.free]
max_parallel_runs = 2
max_scenarios = 100
max_horizon = 12
mip_gap_floor = 0.05
weight = 1.0
stage_timeouts = { compile_ms = 2000, forecast_ms = 5000, policy_ms = 1000, optimise_ms = 10000, diagnose_ms = 5000, explain_ms = 3000, evidence_ms = 2000 }
budget = { solver_sec = 600.0, llm_tokens = 100000.0, gpu_sec = 0.0 }

[scheduler]
admission_timeout_ms = 2000

[idempotency]
ttl_ms = 86400000

[store]
type = "sqlite"
path = "dyocense.sqlite3"

[evidence]
root_path = "evidence"
"#
        .to_string()
    }

    #[test]
    fn loads_and_validates_a_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{}", sample_toml()).expect("write");
        let config = KernelConfig::load(Some(file.path())).expect("config should load");
        assert_eq!(config.idempotency.ttl_ms, 86_400_000);
        assert!(config.caps_for(Tier::Free).is_some());
        assert!(config.caps_for(Tier::Enterprise).is_none());
    }

    #[test]
    fn rejects_empty_tenancy() {
        let mut config = KernelConfig {
            tenancy: TenancyConfig { tiers: BTreeMap::new() },
            scheduler: SchedulerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            store: StoreConfig::Sqlite(SqliteStoreConfig {
                path: PathBuf::from("x.sqlite3"),
                sync_mode: SqliteSyncMode::Full,
                busy_timeout_ms: DEFAULT_SQLITE_BUSY_TIMEOUT_MS,
            }),
            evidence: EvidenceConfig {
                root_path: PathBuf::from("evidence"),
                max_attempts: DEFAULT_EVIDENCE_MAX_ATTEMPTS,
                backoff_base_ms: DEFAULT_EVIDENCE_BACKOFF_BASE_MS,
                backoff_cap_ms: DEFAULT_EVIDENCE_BACKOFF_CAP_MS,
            },
            source_modified_at: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_idempotency_ttl_out_of_range() {
        let config = IdempotencyConfig { ttl_ms: 1_000 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_tier_weight() {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            Tier::Free,
            TierDefaults {
                max_parallel_runs: 1,
                max_scenarios: 10,
                max_horizon: 4,
                stage_timeouts: StageTimeouts {
                    compile_ms: 1,
                    forecast_ms: 1,
                    policy_ms: 1,
                    optimise_ms: 1,
                    diagnose_ms: 1,
                    explain_ms: 1,
                    evidence_ms: 1,
                },
                mip_gap_floor: 0.01,
                budget: BudgetVector { solver_sec: 1.0, llm_tokens: 1.0, gpu_sec: 0.0 },
                weight: 0.0,
            },
        );
        let tenancy = TenancyConfig { tiers };
        assert!(tenancy.validate().is_err());
    }

    #[test]
    fn resolved_worker_pool_size_falls_back_to_parallelism() {
        let config = SchedulerConfig::default();
        assert!(config.resolved_worker_pool_size() >= 1);
    }
}
