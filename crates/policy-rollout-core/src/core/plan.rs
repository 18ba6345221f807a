// crates/policy-rollout-core/src/core/plan.rs
// ============================================================================
// Module: Policy Rollout Plans
// Description: Rollout requests, policy artifacts, and materialized run plans.
// Purpose: Describe what an operator asks for and what the planner persists.
// Dependencies: crate::core::{hashing, state}, serde
// ============================================================================

//! ## Overview
//! A [`RolloutRequest`] is the operator input: the fleet, the stage
//! definitions, and one generated [`PolicyArtifact`] per hostname. The
//! planner validates it and produces a [`RunPlan`], which the state store
//! writes in a single transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::hash_bytes;
use crate::core::identifiers::RunId;
use crate::core::state::FailureThreshold;
use crate::core::state::RolloutRun;
use crate::core::state::RolloutStage;
use crate::core::state::RolloutTarget;
use crate::core::state::TargetSelector;

// ============================================================================
// SECTION: Policy Artifacts
// ============================================================================

/// Generated configuration payload for one router.
///
/// # Invariants
/// - `content_hash` is declared by the generator; the planner verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    /// Policy text pushed to the device.
    pub content: String,
    /// Declared content hash.
    pub content_hash: HashDigest,
}

impl PolicyArtifact {
    /// Builds an artifact and hashes its content.
    #[must_use]
    pub fn from_content(content: impl Into<String>) -> Self {
        let content = content.into();
        let content_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, content.as_bytes());
        Self {
            content,
            content_hash,
        }
    }

    /// Returns true when the declared hash matches the content.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        hash_bytes(self.content_hash.algorithm, self.content.as_bytes()) == self.content_hash
    }
}

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Operator-supplied stage definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Human-readable stage name.
    pub name: String,
    /// Execution order (unique within the request).
    pub sequencing: i64,
    /// Target assignment criteria.
    pub target_selector: TargetSelector,
    /// Optional stage-specific failure threshold.
    #[serde(default)]
    pub failure_threshold: Option<FailureThreshold>,
}

/// Operator request to create a rollout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRequest {
    /// Explicit run identifier; generated when absent.
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Operator or system requesting the rollout.
    pub initiated_by: String,
    /// Validate on devices without committing.
    #[serde(default)]
    pub dry_run: bool,
    /// Run-level failure threshold; executor default when absent.
    #[serde(default)]
    pub failure_threshold: Option<FailureThreshold>,
    /// Fleet hostnames, in the order targets should be created.
    pub targets: Vec<String>,
    /// Stage definitions.
    pub stages: Vec<StageDefinition>,
    /// Policy artifacts keyed by hostname.
    pub artifacts: BTreeMap<String, PolicyArtifact>,
}

// ============================================================================
// SECTION: Materialized Plans
// ============================================================================

/// Target row plus the artifact persisted alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTarget {
    /// Target row in `pending` state.
    pub target: RolloutTarget,
    /// Artifact to apply.
    pub artifact: PolicyArtifact,
}

/// Stage row plus its targets in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    /// Stage row.
    pub stage: RolloutStage,
    /// Targets in creation order.
    pub targets: Vec<PlannedTarget>,
}

/// Validated rows written atomically by [`crate::StateStore::create_run`].
///
/// # Invariants
/// - Stages are sorted by ascending sequencing.
/// - Every hostname appears in exactly one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Run row in `planning` status.
    pub run: RolloutRun,
    /// Stages in execution order.
    pub stages: Vec<PlannedStage>,
}

impl RunPlan {
    /// Returns the number of targets across all stages.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.targets.len()).sum()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
