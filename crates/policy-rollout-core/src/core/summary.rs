// crates/policy-rollout-core/src/core/summary.rs
// ============================================================================
// Module: Policy Rollout Summaries
// Description: Aggregate stage statistics and read-API response shapes.
// Purpose: Give dashboards a stable, serializable view of rollout progress.
// Dependencies: crate::core::{event, state}, serde
// ============================================================================

//! ## Overview
//! Aggregates are computed from one consistent snapshot of a run, so the
//! per-stage counts always add up to the stage's target total.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::event::RolloutEvent;
use crate::core::state::RolloutRun;
use crate::core::state::RolloutStage;
use crate::core::state::RolloutTarget;
use crate::core::state::TargetState;
use crate::core::state::failure_ratio;

// ============================================================================
// SECTION: Stage Statistics
// ============================================================================

/// Per-state target counts for one stage.
///
/// # Invariants
/// - `pending + in_progress + completed + failed + skipped == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageStats {
    /// Targets in the stage.
    pub total: u64,
    /// Completed targets.
    pub completed: u64,
    /// In-progress targets.
    pub in_progress: u64,
    /// Pending targets.
    pub pending: u64,
    /// Failed targets.
    pub failed: u64,
    /// Skipped targets.
    pub skipped: u64,
}

impl StageStats {
    /// Adds one target in `state` to the counts.
    pub const fn record(&mut self, state: TargetState) {
        self.add(state, 1);
    }

    /// Adds `count` targets in `state` to the counts.
    pub const fn add(&mut self, state: TargetState, count: u64) {
        self.total += count;
        match state {
            TargetState::Pending => self.pending += count,
            TargetState::InProgress => self.in_progress += count,
            TargetState::Completed => self.completed += count,
            TargetState::Failed => self.failed += count,
            TargetState::Skipped => self.skipped += count,
        }
    }

    /// Counts targets by state.
    #[must_use]
    pub fn from_targets<'a>(targets: impl IntoIterator<Item = &'a RolloutTarget>) -> Self {
        let mut stats = Self::default();
        for target in targets {
            stats.record(target.state);
        }
        stats
    }

    /// Returns `failed / total`.
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        failure_ratio(self.failed, self.total)
    }

    /// Returns true when every target is terminal.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Stage fields with its statistics attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWithStats {
    /// Stage record, flattened on the wire.
    #[serde(flatten)]
    pub stage: RolloutStage,
    /// Per-state counts.
    pub stats: StageStats,
}

// ============================================================================
// SECTION: Read API Responses
// ============================================================================

/// Run summary returned by the status read API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run record.
    pub run: RolloutRun,
    /// Stages in ascending sequencing with counts.
    pub stage_stats: Vec<StageWithStats>,
    /// Most recent events, newest first.
    pub recent_events: Vec<RolloutEvent>,
}

/// `listRollouts` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunList {
    /// Runs, newest first.
    pub runs: Vec<RolloutRun>,
}

/// `getRolloutStatus` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStatus {
    /// Run summary.
    pub summary: RunSummary,
}

/// `getRolloutTargets` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetList {
    /// Targets in creation order.
    pub targets: Vec<RolloutTarget>,
}
