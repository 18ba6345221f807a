// crates/policy-rollout-core/src/core/state.rs
// ============================================================================
// Module: Policy Rollout State Records
// Description: Run, stage, and target records plus their lifecycle enums.
// Purpose: Define the persisted shape of a rollout and its legal transitions.
// Dependencies: crate::core::{hashing, identifiers, time}, serde, thiserror
// ============================================================================

//! ## Overview
//! A rollout run owns an ordered set of stages, and each stage owns an
//! ordered set of targets (one router each). Rows are created once at plan
//! time and never deleted; only status/state bookkeeping fields mutate.
//!
//! Target state is monotonic over `pending -> in_progress -> terminal`.
//! [`TargetMutation`] is the only way a target row changes, and
//! [`TargetMutation::validate`] rejects anything that would leave a terminal
//! state or break the `policy_hash <=> completed` rule.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StageId;
use crate::core::identifiers::TargetId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Run Status
// ============================================================================

/// Rollout run lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and storage.
/// - `completed`, `failed`, and `aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is planned and waiting for an explicit start.
    Planning,
    /// Run is dispatching stages.
    Active,
    /// Run is paused; no new targets are dispatched.
    Paused,
    /// Every stage resolved within its failure threshold.
    Completed,
    /// A stage exceeded its failure threshold.
    Failed,
    /// An operator aborted the run.
    Aborted,
}

impl RunStatus {
    /// All statuses in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Planning,
        Self::Active,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Aborted,
    ];

    /// Returns true when no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns true when `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planning, Self::Active | Self::Aborted)
                | (Self::Active, Self::Paused | Self::Completed | Self::Failed | Self::Aborted)
                | (Self::Paused, Self::Active | Self::Completed | Self::Failed | Self::Aborted)
        )
    }

    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownLabel;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| UnknownLabel(raw.to_string()))
    }
}

// ============================================================================
// SECTION: Target State
// ============================================================================

/// Per-target application state.
///
/// # Invariants
/// - Transitions follow `pending -> in_progress -> (completed | failed | skipped)`;
///   `pending -> skipped` is also legal (abort).
/// - Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Waiting for dispatch.
    Pending,
    /// Owned by exactly one worker.
    InProgress,
    /// Policy applied and hash verified.
    Completed,
    /// Apply failed permanently or exhausted retries.
    Failed,
    /// Never applied because the run was aborted.
    Skipped,
}

impl TargetState {
    /// All states in declaration order.
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::InProgress, Self::Completed, Self::Failed, Self::Skipped];

    /// Returns true for `completed`, `failed`, and `skipped`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true when `self -> next` moves forward in the partial order.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Skipped)
                | (Self::InProgress, Self::Completed | Self::Failed | Self::Skipped)
        )
    }

    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = UnknownLabel;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == raw)
            .ok_or_else(|| UnknownLabel(raw.to_string()))
    }
}

/// Unknown status or state label read from storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown label: {0}")]
pub struct UnknownLabel(pub String);

// ============================================================================
// SECTION: Failure Threshold
// ============================================================================

/// Maximum tolerated `failed / total` ratio for a stage.
///
/// # Invariants
/// - Finite and within `0.0..=1.0`.
/// - The default (`0.0`) fails a stage on its first failed target.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct FailureThreshold(f64);

impl FailureThreshold {
    /// Abort on the first failure.
    pub const STRICT: Self = Self(0.0);

    /// Creates a threshold, returning `None` when out of range or not finite.
    #[must_use]
    pub fn new(ratio: f64) -> Option<Self> {
        (ratio.is_finite() && (0.0 ..= 1.0).contains(&ratio)).then_some(Self(ratio))
    }

    /// Returns the raw ratio.
    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }

    /// Returns true when `failed / total` is strictly greater than the threshold.
    #[must_use]
    pub fn exceeded_by(self, failed: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        failure_ratio(failed, total) > self.0
    }
}

impl TryFrom<f64> for FailureThreshold {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("failure threshold out of range: {value}"))
    }
}

impl From<FailureThreshold> for f64 {
    fn from(value: FailureThreshold) -> Self {
        value.0
    }
}

/// Computes `failed / total`, returning zero for an empty stage.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "Target counts are far below 2^52.")]
pub fn failure_ratio(failed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    failed as f64 / total as f64
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// One end-to-end rollout attempt across a fleet.
///
/// # Invariants
/// - `status` changes only through legal [`RunStatus`] transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Timestamp of the last status change.
    pub updated_at: Timestamp,
    /// Operator or system that requested the rollout.
    pub initiated_by: String,
    /// When true, the policy applier validates without committing device state.
    pub dry_run: bool,
    /// Run-level failure threshold used by stages without an override.
    pub failure_threshold: FailureThreshold,
}

/// Criteria used at planning time to assign targets to a stage.
///
/// # Invariants
/// - Opaque after planning; the executor never re-evaluates selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Explicit hostname list.
    Hostnames {
        /// Hostnames assigned to the stage.
        hostnames: Vec<String>,
    },
    /// Every hostname starting with `prefix`.
    Prefix {
        /// Hostname prefix.
        prefix: String,
    },
    /// Every hostname not claimed by another stage.
    Remaining,
}

impl TargetSelector {
    /// Returns true when the selector explicitly matches `hostname`.
    ///
    /// [`TargetSelector::Remaining`] never matches directly; the planner
    /// resolves it after all other selectors.
    #[must_use]
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Hostnames {
                hostnames,
            } => hostnames.iter().any(|candidate| candidate == hostname),
            Self::Prefix {
                prefix,
            } => hostname.starts_with(prefix.as_str()),
            Self::Remaining => false,
        }
    }
}

/// Ordered batch of targets applied together before advancing.
///
/// # Invariants
/// - `sequencing` is unique within a run and immutable after planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStage {
    /// Stage identifier.
    pub stage_id: StageId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Execution order within the run (ascending).
    pub sequencing: i64,
    /// Human-readable stage name.
    pub name: String,
    /// Selector used at planning time.
    pub target_selector: TargetSelector,
    /// Optional stage-specific failure threshold.
    pub failure_threshold: Option<FailureThreshold>,
}

impl RolloutStage {
    /// Returns the threshold that applies to this stage.
    #[must_use]
    pub fn effective_threshold(&self, run: &RolloutRun) -> FailureThreshold {
        self.failure_threshold.unwrap_or(run.failure_threshold)
    }
}

/// One router's policy change within a stage.
///
/// # Invariants
/// - `policy_hash` is `Some` if and only if `state` is `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutTarget {
    /// Target identifier.
    pub target_id: TargetId,
    /// Owning stage identifier.
    pub stage_id: StageId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Router hostname.
    pub hostname: String,
    /// Current state.
    pub state: TargetState,
    /// Content hash of the planned artifact.
    pub planned_hash: HashDigest,
    /// Hash reported by the device after a verified apply.
    pub policy_hash: Option<HashDigest>,
    /// Number of apply attempts made so far.
    pub attempt_count: u32,
    /// Most recent apply error.
    pub last_error: Option<String>,
    /// Timestamp of the last mutation.
    pub updated_at: Timestamp,
}

// ============================================================================
// SECTION: Target Mutations
// ============================================================================

/// Conditional target write applied atomically by the state store.
///
/// # Invariants
/// - Applies only when the stored state equals `expected`.
/// - Must pass [`TargetMutation::validate`] before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMutation {
    /// Target to mutate.
    pub target_id: TargetId,
    /// State the target must currently be in.
    pub expected: TargetState,
    /// State to write.
    pub next: TargetState,
    /// Increments `attempt_count` when true.
    pub increment_attempts: bool,
    /// Replaces `last_error` when set.
    pub last_error: Option<String>,
    /// Applied policy hash; required for and limited to `completed`.
    pub policy_hash: Option<HashDigest>,
    /// Mutation timestamp.
    pub at: Timestamp,
}

impl TargetMutation {
    /// Plain state transition with no bookkeeping changes.
    #[must_use]
    pub const fn transition(
        target_id: TargetId,
        expected: TargetState,
        next: TargetState,
        at: Timestamp,
    ) -> Self {
        Self {
            target_id,
            expected,
            next,
            increment_attempts: false,
            last_error: None,
            policy_hash: None,
            at,
        }
    }

    /// Claims a pending target for a worker.
    #[must_use]
    pub const fn claim(target_id: TargetId, at: Timestamp) -> Self {
        Self::transition(target_id, TargetState::Pending, TargetState::InProgress, at)
    }

    /// Records the start of another apply attempt on an owned target.
    #[must_use]
    pub fn begin_attempt(target_id: TargetId, at: Timestamp) -> Self {
        Self {
            increment_attempts: true,
            ..Self::transition(target_id, TargetState::InProgress, TargetState::InProgress, at)
        }
    }

    /// Records a retryable error on an owned target.
    #[must_use]
    pub fn note_error(target_id: TargetId, error: impl Into<String>, at: Timestamp) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::transition(target_id, TargetState::InProgress, TargetState::InProgress, at)
        }
    }

    /// Completes an owned target with its verified policy hash.
    #[must_use]
    pub fn complete(target_id: TargetId, policy_hash: HashDigest, at: Timestamp) -> Self {
        Self {
            policy_hash: Some(policy_hash),
            ..Self::transition(target_id, TargetState::InProgress, TargetState::Completed, at)
        }
    }

    /// Fails an owned target with an error message.
    #[must_use]
    pub fn fail(target_id: TargetId, error: impl Into<String>, at: Timestamp) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::transition(target_id, TargetState::InProgress, TargetState::Failed, at)
        }
    }

    /// Validates the mutation against the target lifecycle rules.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMutation`] when the mutation would break monotonicity
    /// or the `policy_hash <=> completed` invariant.
    pub fn validate(&self) -> Result<(), InvalidMutation> {
        let bookkeeping_only =
            self.expected == TargetState::InProgress && self.next == TargetState::InProgress;
        if !bookkeeping_only && !self.expected.can_transition_to(self.next) {
            return Err(InvalidMutation::IllegalTransition {
                target_id: self.target_id.clone(),
                from: self.expected,
                to: self.next,
            });
        }
        if self.increment_attempts && self.expected != TargetState::InProgress {
            return Err(InvalidMutation::AttemptOutsideOwnership(self.target_id.clone()));
        }
        match (self.next, self.policy_hash.is_some()) {
            (TargetState::Completed, false) => {
                Err(InvalidMutation::MissingPolicyHash(self.target_id.clone()))
            }
            (state, true) if state != TargetState::Completed => {
                Err(InvalidMutation::UnexpectedPolicyHash(self.target_id.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Mutation rejected before reaching storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidMutation {
    /// Transition moves backwards or leaves a terminal state.
    #[error("illegal target transition for {target_id}: {from} -> {to}")]
    IllegalTransition {
        /// Target identifier.
        target_id: TargetId,
        /// Expected current state.
        from: TargetState,
        /// Requested next state.
        to: TargetState,
    },
    /// Attempt counter bumped on a target the caller does not own.
    #[error("attempt recorded outside in_progress ownership for {0}")]
    AttemptOutsideOwnership(TargetId),
    /// Completion without a policy hash.
    #[error("completed transition for {0} requires a policy hash")]
    MissingPolicyHash(TargetId),
    /// Policy hash on a non-completed state.
    #[error("policy hash is only valid on completion for {0}")]
    UnexpectedPolicyHash(TargetId),
}

// ============================================================================
// SECTION: Tests
// ============================================================================
