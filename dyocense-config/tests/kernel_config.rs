// dyocense-config/tests/kernel_config.rs
// ============================================================================
// Integration tests for KernelConfig loading and validation.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    missing_docs,
    reason = "Integration test fixtures use explicit unwraps/asserts for clarity."
)]

use std::io::Write as _;

use dyocense_config::ConfigError;
use dyocense_config::KernelConfig;
use dyocense_core::model::Tier;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "{contents}").expect("write config");
    file
}

const FULL_CONFIG: &str = r#"
[tenancy.tiers.free]
max_parallel_runs = 2
max_scenarios = 100
max_horizon = 12
mip_gap_floor = 0.05
weight = 1.0
stage_timeouts = { compile_ms = 2000, forecast_ms = 5000, policy_ms = 1000, optimise_ms = 10000, diagnose_ms = 5000, explain_ms = 3000, evidence_ms = 2000 }
budget = { solver_sec = 600.0, llm_tokens = 100000.0, gpu_sec = 0.0 }

[tenancy.tiers.pro]
max_parallel_runs = 8
max_scenarios = 1000
max_horizon = 52
mip_gap_floor = 0.01
weight = 4.0
stage_timeouts = { compile_ms = 2000, forecast_ms = 8000, policy_ms = 1000, optimise_ms = 30000, diagnose_ms = 10000, explain_ms = 5000, evidence_ms = 2000 }
budget = { solver_sec = 7200.0, llm_tokens = 2000000.0, gpu_sec = 600.0 }

[scheduler]
worker_pool_size = 4
admission_timeout_ms = 2500
tie_break_salt = 7

[idempotency]
ttl_ms = 86400000

[store]
type = "sqlite"
path = "/var/lib/dyocense/kernel.sqlite3"
sync_mode = "normal"
busy_timeout_ms = 8000

[evidence]
root_path = "/var/lib/dyocense/evidence"
max_attempts = 6
backoff_base_ms = 100
backoff_cap_ms = 5000
"#;

#[test]
fn loads_a_fully_specified_config() {
    let file = write_config(FULL_CONFIG);
    let config = KernelConfig::load(Some(file.path())).expect("config should load");

    assert_eq!(config.scheduler.worker_pool_size, 4);
    assert_eq!(config.scheduler.tie_break_salt, 7);
    assert_eq!(config.idempotency.ttl_ms, 86_400_000);

    let free_caps = config.caps_for(Tier::Free).expect("free tier present");
    assert_eq!(free_caps.max_parallel_runs, 2);
    let pro_weight = config.weight_for(Tier::Pro).expect("pro tier present");
    assert!((pro_weight - 4.0).abs() < f64::EPSILON);

    assert!(config.caps_for(Tier::Standard).is_none());
    assert!(config.caps_for(Tier::Enterprise).is_none());
}

#[test]
fn applies_scheduler_and_idempotency_defaults_when_omitted() {
    let minimal = r#"
[tenancy.tiers.free]
max_parallel_runs = 1
max_scenarios = 10
max_horizon = 4
mip_gap_floor = 0.05
weight = 1.0
stage_timeouts = { compile_ms = 1000, forecast_ms = 1000, policy_ms = 1000, optimise_ms = 1000, diagnose_ms = 1000, explain_ms = 1000, evidence_ms = 1000 }
budget = { solver_sec = 60.0, llm_tokens = 1000.0, gpu_sec = 0.0 }

[store]
type = "sqlite"
path = "kernel.sqlite3"

[evidence]
root_path = "evidence"
"#;
    let file = write_config(minimal);
    let config = KernelConfig::load(Some(file.path())).expect("config should load");

    assert_eq!(config.idempotency.ttl_ms, 24 * 60 * 60 * 1000);
    assert_eq!(config.scheduler.admission_timeout_ms, 2_000);
    assert!(config.scheduler.resolved_worker_pool_size() >= 1);
    assert_eq!(config.evidence.max_attempts, 5);
}

#[test]
fn rejects_oversized_config_file() {
    let oversized = "# padding\n".repeat(200_000);
    let file = write_config(&oversized);
    let result = KernelConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn rejects_missing_file() {
    let result = KernelConfig::load(Some(std::path::Path::new("/nonexistent/dyocense.toml")));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn rejects_malformed_toml() {
    let file = write_config("this is not [ valid toml");
    let result = KernelConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn rejects_out_of_range_admission_timeout() {
    let bad = FULL_CONFIG.replace("admission_timeout_ms = 2500", "admission_timeout_ms = 99999");
    let file = write_config(&bad);
    let result = KernelConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn rejects_backoff_cap_below_base() {
    let bad = FULL_CONFIG
        .replace("backoff_base_ms = 100", "backoff_base_ms = 1000")
        .replace("backoff_cap_ms = 5000", "backoff_cap_ms = 500");
    let file = write_config(&bad);
    let result = KernelConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}
