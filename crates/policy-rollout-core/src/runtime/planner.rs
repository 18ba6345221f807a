// crates/policy-rollout-core/src/runtime/planner.rs
// ============================================================================
// Module: Policy Rollout Planner
// Description: Request validation and all-or-nothing run materialization.
// Purpose: Turn an operator request into persisted run, stage, and target rows.
// Dependencies: crate::{core, interfaces, runtime::store}, thiserror, tracing
// ============================================================================

//! ## Overview
//! Planning is pure until the final [`StateStore::create_run`] call, which
//! writes every row in one transaction. Any validation failure returns
//! before the store is touched, so a rejected request leaves no state.
//!
//! Assignment rules:
//! - Explicit selectors (`hostnames`, `prefix`) must not overlap.
//! - A single `remaining` stage absorbs every unclaimed hostname.
//! - Every stage must end up with at least one target.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::core::Clock;
use crate::core::FailureThreshold;
use crate::core::PlannedStage;
use crate::core::PlannedTarget;
use crate::core::RolloutRequest;
use crate::core::RolloutRun;
use crate::core::RolloutStage;
use crate::core::RolloutTarget;
use crate::core::RunId;
use crate::core::RunPlan;
use crate::core::RunStatus;
use crate::core::StageId;
use crate::core::TargetId;
use crate::core::TargetSelector;
use crate::core::TargetState;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;
use crate::runtime::store::SharedStateStore;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Malformed rollout request. Nothing is written when returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Target list is empty.
    #[error("target list must not be empty")]
    EmptyTargets,
    /// Stage set is empty.
    #[error("stage set must not be empty")]
    EmptyStages,
    /// Request has no initiator.
    #[error("initiated_by must not be empty")]
    MissingInitiator,
    /// Target hostname is empty.
    #[error("target hostname must not be empty")]
    EmptyHostname,
    /// Run identifier is empty or contains the identifier separator.
    #[error("run id must be non-empty and must not contain '/': {0}")]
    InvalidRunId(RunId),
    /// Hostname contains the identifier separator.
    #[error("target hostname must not contain '/': {0}")]
    InvalidHostname(String),
    /// Hostname listed more than once.
    #[error("duplicate target hostname: {0}")]
    DuplicateTarget(String),
    /// Stage sequencing reused.
    #[error("duplicate stage sequencing: {0}")]
    DuplicateSequencing(i64),
    /// Hostname selected by more than one stage.
    #[error("target {hostname} assigned to both {first} and {second}")]
    DuplicateStageAssignment {
        /// Target hostname.
        hostname: String,
        /// First matching stage name.
        first: String,
        /// Second matching stage name.
        second: String,
    },
    /// Hostname selected by no stage.
    #[error("target {0} is not assigned to any stage")]
    UnassignedTarget(String),
    /// Explicit selector names a hostname outside the target list.
    #[error("stage {stage} selects unknown target {hostname}")]
    UnknownSelectorHost {
        /// Stage name.
        stage: String,
        /// Unknown hostname.
        hostname: String,
    },
    /// More than one `remaining` selector.
    #[error("at most one stage may use the remaining selector")]
    MultipleRemainingSelectors,
    /// Stage selects no targets.
    #[error("stage {0} selects no targets")]
    EmptyStage(String),
    /// Target has no artifact.
    #[error("missing policy artifact for target {0}")]
    MissingArtifact(String),
    /// Artifact content does not hash to its declared hash.
    #[error("policy artifact hash mismatch for target {0}")]
    ArtifactHashMismatch(String),
    /// Run identifier already used.
    #[error("run already exists: {0}")]
    RunAlreadyExists(RunId),
}

/// Planner failures.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Request rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Store rejected the write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Planner
// ============================================================================

/// Validates rollout requests and writes their initial rows.
#[derive(Clone)]
pub struct RolloutPlanner {
    /// Backing store.
    store: SharedStateStore,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Threshold applied when the request does not set one.
    default_threshold: FailureThreshold,
}

impl RolloutPlanner {
    /// Creates a planner.
    #[must_use]
    pub fn new(
        store: SharedStateStore,
        clock: Arc<dyn Clock>,
        default_threshold: FailureThreshold,
    ) -> Self {
        Self {
            store,
            clock,
            default_threshold,
        }
    }

    /// Validates a request and writes the run in `planning` status.
    ///
    /// # Errors
    ///
    /// Returns [`PlannerError::Validation`] for malformed requests and
    /// [`PlannerError::Store`] when persistence fails.
    pub fn create_run(&self, request: &RolloutRequest) -> Result<RolloutRun, PlannerError> {
        let plan = self.plan(request)?;
        if self.store.load_run(&plan.run.run_id)?.is_some() {
            return Err(ValidationError::RunAlreadyExists(plan.run.run_id).into());
        }
        self.store.create_run(&plan)?;
        info!(
            run_id = %plan.run.run_id,
            stages = plan.stages.len(),
            targets = plan.target_count(),
            dry_run = plan.run.dry_run,
            "rollout run planned"
        );
        Ok(plan.run)
    }

    /// Validates a request and builds its rows without writing them.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the request is malformed.
    pub fn plan(&self, request: &RolloutRequest) -> Result<RunPlan, ValidationError> {
        validate_shape(request)?;
        let mut definitions: Vec<_> = request.stages.iter().collect();
        definitions.sort_by_key(|stage| stage.sequencing);

        let known: BTreeSet<&str> = request.targets.iter().map(String::as_str).collect();
        for stage in &definitions {
            if let TargetSelector::Hostnames {
                hostnames,
            } = &stage.target_selector
                && let Some(unknown) =
                    hostnames.iter().find(|hostname| !known.contains(hostname.as_str()))
            {
                return Err(ValidationError::UnknownSelectorHost {
                    stage: stage.name.clone(),
                    hostname: unknown.clone(),
                });
            }
        }

        let remaining_index = definitions
            .iter()
            .position(|stage| stage.target_selector == TargetSelector::Remaining);
        let mut assigned: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for hostname in &request.targets {
            let mut matching = definitions
                .iter()
                .enumerate()
                .filter(|(_, stage)| stage.target_selector.matches(hostname));
            let index = match (matching.next(), matching.next()) {
                (Some((index, _)), None) => index,
                (Some((_, first)), Some((_, second))) => {
                    return Err(ValidationError::DuplicateStageAssignment {
                        hostname: hostname.clone(),
                        first: first.name.clone(),
                        second: second.name.clone(),
                    });
                }
                (None, _) => remaining_index
                    .ok_or_else(|| ValidationError::UnassignedTarget(hostname.clone()))?,
            };
            assigned.entry(index).or_default().push(hostname);
        }

        let now = self.clock.now();
        let run_id = request.run_id.clone().unwrap_or_else(RunId::generate);
        let mut stages = Vec::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            let hostnames = assigned.remove(&index).unwrap_or_default();
            if hostnames.is_empty() {
                return Err(ValidationError::EmptyStage(definition.name.clone()));
            }
            let stage_id = StageId::for_stage(&run_id, definition.sequencing);
            let mut targets = Vec::with_capacity(hostnames.len());
            for hostname in hostnames {
                let artifact = request
                    .artifacts
                    .get(hostname)
                    .ok_or_else(|| ValidationError::MissingArtifact(hostname.to_string()))?;
                if !artifact.is_consistent() {
                    return Err(ValidationError::ArtifactHashMismatch(hostname.to_string()));
                }
                targets.push(PlannedTarget {
                    target: RolloutTarget {
                        target_id: TargetId::for_target(&stage_id, hostname),
                        stage_id: stage_id.clone(),
                        run_id: run_id.clone(),
                        hostname: hostname.to_string(),
                        state: TargetState::Pending,
                        planned_hash: artifact.content_hash.clone(),
                        policy_hash: None,
                        attempt_count: 0,
                        last_error: None,
                        updated_at: now,
                    },
                    artifact: artifact.clone(),
                });
            }
            stages.push(PlannedStage {
                stage: RolloutStage {
                    stage_id,
                    run_id: run_id.clone(),
                    sequencing: definition.sequencing,
                    name: definition.name.clone(),
                    target_selector: definition.target_selector.clone(),
                    failure_threshold: definition.failure_threshold,
                },
                targets,
            });
        }

        Ok(RunPlan {
            run: RolloutRun {
                run_id,
                status: RunStatus::Planning,
                created_at: now,
                updated_at: now,
                initiated_by: request.initiated_by.clone(),
                dry_run: request.dry_run,
                failure_threshold: request.failure_threshold.unwrap_or(self.default_threshold),
            },
            stages,
        })
    }
}

/// Separator used when deriving stage and target identifiers.
const ID_SEPARATOR: char = '/';

/// Checks request-level constraints that do not depend on assignment.
fn validate_shape(request: &RolloutRequest) -> Result<(), ValidationError> {
    if let Some(run_id) = &request.run_id
        && (run_id.as_str().trim().is_empty() || run_id.as_str().contains(ID_SEPARATOR))
    {
        return Err(ValidationError::InvalidRunId(run_id.clone()));
    }
    if request.targets.is_empty() {
        return Err(ValidationError::EmptyTargets);
    }
    if request.stages.is_empty() {
        return Err(ValidationError::EmptyStages);
    }
    if request.initiated_by.trim().is_empty() {
        return Err(ValidationError::MissingInitiator);
    }
    let mut hostnames = BTreeSet::new();
    for hostname in &request.targets {
        if hostname.trim().is_empty() {
            return Err(ValidationError::EmptyHostname);
        }
        if hostname.contains(ID_SEPARATOR) {
            return Err(ValidationError::InvalidHostname(hostname.clone()));
        }
        if !hostnames.insert(hostname.as_str()) {
            return Err(ValidationError::DuplicateTarget(hostname.clone()));
        }
    }
    let mut sequencing = BTreeSet::new();
    for stage in &request.stages {
        if !sequencing.insert(stage.sequencing) {
            return Err(ValidationError::DuplicateSequencing(stage.sequencing));
        }
    }
    let remaining = request
        .stages
        .iter()
        .filter(|stage| stage.target_selector == TargetSelector::Remaining)
        .count();
    if remaining > 1 {
        return Err(ValidationError::MultipleRemainingSelectors);
    }
    Ok(())
}
