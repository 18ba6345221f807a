// crates/policy-rollout-core/src/core/mod.rs
// ============================================================================
// Module: Policy Rollout Core Types
// Description: Canonical rollout records, events, plans, and summaries.
// Purpose: Provide stable, serializable types shared by every backend.
// Dependencies: serde, sha2, time, uuid
// ============================================================================

//! ## Overview
//! Core types describe rollout runs, their ordered stages and per-router
//! targets, the typed event trail, and the aggregate views served to
//! dashboards. These types are the canonical source of truth for storage
//! backends and read APIs.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod event;
pub mod hashing;
pub mod identifiers;
pub mod plan;
pub mod state;
pub mod summary;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use event::ApplyErrorKind;
pub use event::EventPayload;
pub use event::EventQuery;
pub use event::EventType;
pub use event::NewEvent;
pub use event::RolloutEvent;
pub use event::StageOutcome;
pub use hashing::DEFAULT_HASH_ALGORITHM;
pub use hashing::HashAlgorithm;
pub use hashing::HashDigest;
pub use hashing::HashError;
pub use hashing::hash_bytes;
pub use identifiers::EventId;
pub use identifiers::RunId;
pub use identifiers::StageId;
pub use identifiers::TargetId;
pub use plan::PlannedStage;
pub use plan::PlannedTarget;
pub use plan::PolicyArtifact;
pub use plan::RolloutRequest;
pub use plan::RunPlan;
pub use plan::StageDefinition;
pub use state::FailureThreshold;
pub use state::InvalidMutation;
pub use state::RolloutRun;
pub use state::RolloutStage;
pub use state::RolloutTarget;
pub use state::RunStatus;
pub use state::TargetMutation;
pub use state::TargetSelector;
pub use state::TargetState;
pub use state::UnknownLabel;
pub use summary::RolloutStatus;
pub use summary::RunList;
pub use summary::RunSummary;
pub use summary::StageStats;
pub use summary::StageWithStats;
pub use summary::TargetList;
pub use time::Clock;
pub use time::ManualClock;
pub use time::SystemClock;
pub use time::Timestamp;
