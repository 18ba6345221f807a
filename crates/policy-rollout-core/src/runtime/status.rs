// crates/policy-rollout-core/src/runtime/status.rs
// ============================================================================
// Module: Policy Rollout Status Service
// Description: Read-only aggregation API for dashboards and operators.
// Purpose: Serve run lists, run summaries, and stage targets without side effects.
// Dependencies: crate::{core, interfaces, runtime::store}, thiserror
// ============================================================================

//! ## Overview
//! Every call is a pure read against the state store. Stage statistics come
//! from one store snapshot, so counts always add up to the stage total even
//! while workers are writing. Callers poll; nothing here blocks writers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::EventQuery;
use crate::core::RolloutStatus;
use crate::core::RunId;
use crate::core::RunList;
use crate::core::RunStatus;
use crate::core::RunSummary;
use crate::core::StageId;
use crate::core::TargetList;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;
use crate::runtime::store::SharedStateStore;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default number of events in a run summary.
pub const DEFAULT_RECENT_EVENTS_LIMIT: usize = 20;
/// Default upper bound for `list_runs` limits.
pub const DEFAULT_MAX_LIST_LIMIT: usize = 500;

/// Status service limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusConfig {
    /// Events returned in a run summary.
    pub recent_events_limit: usize,
    /// Largest accepted `list_runs` limit.
    pub max_list_limit: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            recent_events_limit: DEFAULT_RECENT_EVENTS_LIMIT,
            max_list_limit: DEFAULT_MAX_LIST_LIMIT,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Read API failures.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Run does not exist.
    #[error("rollout run not found: {0}")]
    RunNotFound(RunId),
    /// Stage does not belong to the run.
    #[error("stage {stage_id} not found in run {run_id}")]
    StageNotFound {
        /// Run identifier.
        run_id: RunId,
        /// Stage identifier.
        stage_id: StageId,
    },
    /// Limit outside `1..=max`.
    #[error("limit must be between 1 and {max}, got {limit}")]
    InvalidLimit {
        /// Requested limit.
        limit: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Read-only rollout status API.
#[derive(Clone)]
pub struct StatusService {
    /// Backing store.
    store: SharedStateStore,
    /// Limits.
    config: StatusConfig,
}

impl StatusService {
    /// Creates a status service.
    #[must_use]
    pub const fn new(store: SharedStateStore, config: StatusConfig) -> Self {
        Self {
            store,
            config,
        }
    }

    /// Lists runs newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::InvalidLimit`] for a limit outside
    /// `1..=max_list_limit` and [`StatusError::Store`] on store failure.
    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<RunList, StatusError> {
        if limit == 0 || limit > self.config.max_list_limit {
            return Err(StatusError::InvalidLimit {
                limit,
                max: self.config.max_list_limit,
            });
        }
        Ok(RunList {
            runs: self.store.list_runs(status, limit)?,
        })
    }

    /// Returns the run, its stages with counts, and its most recent events.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::RunNotFound`] for unknown runs and
    /// [`StatusError::Store`] on store failure.
    pub fn get_run_summary(&self, run_id: &RunId) -> Result<RolloutStatus, StatusError> {
        let run = self
            .store
            .load_run(run_id)?
            .ok_or_else(|| StatusError::RunNotFound(run_id.clone()))?;
        let stage_stats = self.store.run_stage_stats(run_id)?;
        let recent_events = self
            .store
            .list_events(&EventQuery::recent(run_id.clone(), self.config.recent_events_limit))?;
        Ok(RolloutStatus {
            summary: RunSummary {
                run,
                stage_stats,
                recent_events,
            },
        })
    }

    /// Returns a stage's targets in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::RunNotFound`] or [`StatusError::StageNotFound`]
    /// when the pair does not exist and [`StatusError::Store`] on store failure.
    pub fn get_targets(
        &self,
        run_id: &RunId,
        stage_id: &StageId,
    ) -> Result<TargetList, StatusError> {
        if self.store.load_run(run_id)?.is_none() {
            return Err(StatusError::RunNotFound(run_id.clone()));
        }
        let stages = self.store.list_stages(run_id)?;
        if !stages.iter().any(|stage| &stage.stage_id == stage_id) {
            return Err(StatusError::StageNotFound {
                run_id: run_id.clone(),
                stage_id: stage_id.clone(),
            });
        }
        Ok(TargetList {
            targets: self.store.list_targets(stage_id)?,
        })
    }
}
