// crates/policy-rollout-store-sqlite/src/lib.rs
// ============================================================================
// Module: Policy Rollout SQLite Store Library
// Description: Public API surface for the SQLite-backed state store.
// Purpose: Expose the durable StateStore and its configuration.
// Dependencies: crate::store
// ============================================================================

//! ## Overview
//! Durable [`policy_rollout_core::StateStore`] implementation backed by
//! `SQLite`. Runs, stages, targets, and events live in normalized tables so
//! every conditional transition is a single guarded `UPDATE`.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SCHEMA_VERSION;
pub use store::SqliteStateStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
