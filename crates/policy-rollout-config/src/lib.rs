// crates/policy-rollout-config/src/lib.rs
// ============================================================================
// Module: Policy Rollout Config Library
// Description: Configuration model, loading, and validation.
// Purpose: Turn `policy-rollout.toml` into validated runtime components.
// Dependencies: crate::config
// ============================================================================

//! ## Overview
//! Canonical configuration for the rollout orchestrator. [`RolloutConfig`]
//! loads TOML with path and size limits, validates every section fail-closed,
//! and exposes builders for the executor settings, state store, audit sink,
//! and safety gate.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::AuditConfig;
pub use config::AuditSinkKind;
pub use config::CONFIG_ENV_VAR;
pub use config::ConfigError;
pub use config::DEFAULT_CONFIG_NAME;
pub use config::ExecutorSettings;
pub use config::MAX_CONFIG_FILE_BYTES;
pub use config::RolloutConfig;
pub use config::SafetyGateConfig;
pub use config::SafetyGateKind;
pub use config::StateStoreConfig;
pub use config::StateStoreType;
pub use config::StatusSettings;
pub use config::WorkerSettings;
pub use config::build_event_sink;
pub use config::build_safety_gate;
pub use config::build_state_store;
