// crates/policy-rollout-config/tests/common/mod.rs
// =============================================================================
// Module: Config Test Helpers
// Description: Shared config fixtures and assertions.
// Purpose: Reduce duplication across policy-rollout-config integration tests.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]

use policy_rollout_config::ConfigError;
use policy_rollout_config::RolloutConfig;

/// Result type for config tests.
pub type TestResult = Result<(), String>;

/// Returns the all-defaults config, validated.
pub fn minimal_config() -> Result<RolloutConfig, ConfigError> {
    RolloutConfig::from_toml_str("")
}

/// Checks that `result` failed with a message containing `needle`.
pub fn assert_invalid<T>(result: Result<T, ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(_) => Err("expected invalid config".to_string()),
    }
}

/// Fails with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: &str) -> TestResult {
    if condition { Ok(()) } else { Err(message.to_string()) }
}
