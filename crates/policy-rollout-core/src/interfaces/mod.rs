// crates/policy-rollout-core/src/interfaces/mod.rs
// ============================================================================
// Module: Policy Rollout Interfaces
// Description: Backend-agnostic contracts for storage, apply, gating, and audit.
// Purpose: Define the seams between the orchestrator and external collaborators.
// Dependencies: crate::core, async-trait, thiserror, tokio
// ============================================================================

//! ## Overview
//! The orchestrator talks to the outside world through four contracts:
//! [`StateStore`] (the single source of truth), [`PolicyApplier`] (device
//! push), [`SafetyGate`] (pre-stage predicate), and [`EventSink`] (audit
//! mirror). Implementations must fail closed on missing or invalid data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::ApplyErrorKind;
use crate::core::EventQuery;
use crate::core::HashDigest;
use crate::core::InvalidMutation;
use crate::core::NewEvent;
use crate::core::PolicyArtifact;
use crate::core::RolloutEvent;
use crate::core::RolloutRun;
use crate::core::RolloutStage;
use crate::core::RolloutTarget;
use crate::core::RunId;
use crate::core::RunPlan;
use crate::core::RunStatus;
use crate::core::StageId;
use crate::core::StageWithStats;
use crate::core::TargetId;
use crate::core::TargetMutation;
use crate::core::TargetState;
use crate::core::Timestamp;

// ============================================================================
// SECTION: State Store
// ============================================================================

/// State store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store I/O error.
    #[error("rollout state store io error: {0}")]
    Io(String),
    /// Store data is corrupted or fails integrity checks.
    #[error("rollout state store corruption: {0}")]
    Corrupt(String),
    /// Store data version is incompatible.
    #[error("rollout state store version mismatch: {0}")]
    VersionMismatch(String),
    /// Request or stored data is invalid.
    #[error("rollout state store invalid data: {0}")]
    Invalid(String),
    /// Referenced record does not exist.
    #[error("rollout state store record not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency contention; safe to retry.
    #[error("rollout state store conflict: {0}")]
    Conflict(String),
    /// Store reported an error.
    #[error("rollout state store error: {0}")]
    Store(String),
}

impl StoreError {
    /// Returns true when the operation may succeed if retried.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<InvalidMutation> for StoreError {
    fn from(err: InvalidMutation) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Durable, transactional record of runs, stages, targets, and events.
///
/// # Invariants
/// - Target rows change only through [`StateStore::update_target`] and
///   [`StateStore::skip_pending_targets`], both conditional on current state.
/// - Read operations never block writers for longer than a snapshot copy.
pub trait StateStore {
    /// Writes a run with all of its stages and targets in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the run already exists and
    /// [`StoreError`] when persistence fails. No partial state is written.
    fn create_run(&self, plan: &RunPlan) -> Result<(), StoreError>;

    /// Loads a run by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_run(&self, run_id: &RunId) -> Result<Option<RolloutRun>, StoreError>;

    /// Lists runs newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RolloutRun>, StoreError>;

    /// Lists a run's stages in ascending sequencing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn list_stages(&self, run_id: &RunId) -> Result<Vec<RolloutStage>, StoreError>;

    /// Lists a stage's targets in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn list_targets(&self, stage_id: &StageId) -> Result<Vec<RolloutTarget>, StoreError>;

    /// Loads a target by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_target(&self, target_id: &TargetId) -> Result<Option<RolloutTarget>, StoreError>;

    /// Loads the artifact planned for a target.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_artifact(&self, target_id: &TargetId) -> Result<Option<PolicyArtifact>, StoreError>;

    /// Applies a conditional target mutation.
    ///
    /// Returns `Ok(false)` when the stored state no longer equals
    /// `mutation.expected`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] for mutations that break the target
    /// lifecycle, [`StoreError::NotFound`] for unknown targets, and
    /// [`StoreError`] when persistence fails.
    fn update_target(&self, mutation: &TargetMutation) -> Result<bool, StoreError>;

    /// Atomically moves a target from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] under the same conditions as
    /// [`StateStore::update_target`].
    fn try_transition(
        &self,
        target_id: &TargetId,
        from: TargetState,
        to: TargetState,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        self.update_target(&TargetMutation::transition(target_id.clone(), from, to, at))
    }

    /// Moves every pending target of a run to skipped, returning the count.
    ///
    /// Skips nothing and returns `Ok(0)` once the run is `completed` or
    /// `failed`; the status check and the update share one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown runs and [`StoreError`]
    /// when persistence fails.
    fn skip_pending_targets(&self, run_id: &RunId, at: Timestamp) -> Result<u64, StoreError>;

    /// Moves a run to `to` when its status is one of `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when any `from -> to` pair is illegal,
    /// [`StoreError::NotFound`] for unknown runs, and [`StoreError`] when
    /// persistence fails.
    fn transition_run(
        &self,
        run_id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        at: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Appends an event, assigning its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown runs and [`StoreError`]
    /// when persistence fails.
    fn append_event(&self, event: NewEvent) -> Result<RolloutEvent, StoreError>;

    /// Lists events newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn list_events(&self, query: &EventQuery) -> Result<Vec<RolloutEvent>, StoreError>;

    /// Returns every stage of a run with per-state counts from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn run_stage_stats(&self, run_id: &RunId) -> Result<Vec<StageWithStats>, StoreError>;

    /// Checks whether the store can serve requests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backend is unavailable.
    fn readiness(&self) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

/// Creates a linked cancellation handle and signal.
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle {
            tx,
        },
        CancelSignal {
            rx,
        },
    )
}

/// Owner side of a cancellation channel.
#[derive(Debug)]
pub struct CancelHandle {
    /// Cancellation flag sender.
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation to every subscriber.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a new signal observing this handle.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of a cancellation channel.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    /// Cancellation flag receiver.
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Returns a signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        cancellation().1
    }

    /// Returns true once cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is signalled; pends forever otherwise.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// SECTION: Policy Applier
// ============================================================================

/// Request passed to the policy applier for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    /// Target being applied.
    pub target_id: TargetId,
    /// Router hostname.
    pub hostname: String,
    /// Artifact to push.
    pub artifact: PolicyArtifact,
    /// Validate without committing device state.
    pub dry_run: bool,
    /// Deadline the applier should honour; the worker enforces it regardless.
    pub deadline: Duration,
}

/// Successful apply result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReceipt {
    /// Policy hash reported by the device.
    pub policy_hash: HashDigest,
}

/// Collaborator-classified apply failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Retryable failure.
    #[error("transient apply error: {0}")]
    Transient(String),
    /// Non-retryable failure.
    #[error("permanent apply error: {0}")]
    Permanent(String),
    /// Apply observed cancellation.
    #[error("apply cancelled")]
    Cancelled,
}

impl ApplyError {
    /// Returns the event-level classification.
    #[must_use]
    pub const fn kind(&self) -> ApplyErrorKind {
        match self {
            Self::Transient(_) => ApplyErrorKind::Transient,
            Self::Permanent(_) => ApplyErrorKind::Permanent,
            Self::Cancelled => ApplyErrorKind::Cancelled,
        }
    }
}

/// Pushes a policy artifact to one router.
#[async_trait]
pub trait PolicyApplier: Send + Sync {
    /// Applies the artifact and reports the resulting device policy hash.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`] classified as transient or permanent, or
    /// [`ApplyError::Cancelled`] when `cancel` fired mid-apply.
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: CancelSignal,
    ) -> Result<ApplyReceipt, ApplyError>;
}

// ============================================================================
// SECTION: Safety Gates
// ============================================================================

/// Stage context passed to safety gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateContext {
    /// Run identifier.
    pub run_id: RunId,
    /// Stage about to dispatch.
    pub stage_id: StageId,
    /// Stage sequencing value.
    pub sequencing: i64,
    /// Stage name.
    pub stage_name: String,
    /// Evaluation time.
    pub now: Timestamp,
}

/// Safety gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Stage may dispatch.
    Clear,
    /// Stage must wait.
    Blocked {
        /// Human-readable reason.
        reason: String,
    },
}

/// Read-only pre-stage predicate.
pub trait SafetyGate: Send + Sync {
    /// Evaluates the gate for a stage.
    fn check(&self, context: &GateContext) -> GateDecision;
}

/// Reference data source errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("reference data unavailable: {0}")]
pub struct ReferenceDataError(pub String);

/// Source of routing-security reference data freshness.
pub trait ReferenceDataSource: Send + Sync {
    /// Returns when the reference data was last refreshed, if ever.
    ///
    /// # Errors
    ///
    /// Returns [`ReferenceDataError`] when freshness cannot be determined.
    fn last_refreshed(&self) -> Result<Option<Timestamp>, ReferenceDataError>;
}

// ============================================================================
// SECTION: Event Sink
// ============================================================================

/// Mirror for appended lifecycle events. Failures are swallowed.
pub trait EventSink: Send + Sync {
    /// Records an event.
    fn record(&self, event: &RolloutEvent);
}
