// crates/policy-rollout-core/src/core/event.rs
// ============================================================================
// Module: Policy Rollout Events
// Description: Immutable lifecycle events with fixed per-type payload schemas.
// Purpose: Provide the typed audit trail for runs, stages, and targets.
// Dependencies: crate::core::{hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! Every event payload is a tagged variant keyed by `event_type`, so a
//! consumer can deserialize any event without inspecting a free-form blob.
//! Events are append-only: the state store assigns their identifiers and
//! they are never mutated or deleted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::EventId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StageId;
use crate::core::identifiers::TargetId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Event Types
// ============================================================================

/// Fixed event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Run moved from planning to active.
    RunStarted,
    /// Run paused by an operator.
    RunPaused,
    /// Run resumed by an operator.
    RunResumed,
    /// Run aborted by an operator.
    RunAborted,
    /// Stage dispatch began.
    StageStarted,
    /// Stage resolved within its failure threshold.
    StageCompleted,
    /// Stage exceeded its failure threshold.
    StageFailed,
    /// Worker began an apply attempt.
    ApplyStarted,
    /// Apply verified and target completed.
    ApplySucceeded,
    /// Apply attempt failed.
    ApplyFailed,
    /// Safety gate blocked stage dispatch.
    SafetyGateBlocked,
    /// Operator overrode a blocking safety gate.
    SafetyGateOverridden,
}

impl EventType {
    /// All event types in declaration order.
    pub const ALL: [Self; 12] = [
        Self::RunStarted,
        Self::RunPaused,
        Self::RunResumed,
        Self::RunAborted,
        Self::StageStarted,
        Self::StageCompleted,
        Self::StageFailed,
        Self::ApplyStarted,
        Self::ApplySucceeded,
        Self::ApplyFailed,
        Self::SafetyGateBlocked,
        Self::SafetyGateOverridden,
    ];

    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunPaused => "run_paused",
            Self::RunResumed => "run_resumed",
            Self::RunAborted => "run_aborted",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::ApplyStarted => "apply_started",
            Self::ApplySucceeded => "apply_succeeded",
            Self::ApplyFailed => "apply_failed",
            Self::SafetyGateBlocked => "safety_gate_blocked",
            Self::SafetyGateOverridden => "safety_gate_overridden",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Payloads
// ============================================================================

/// Apply failure classification recorded in `apply_failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    /// Retryable failure (timeouts, connection resets).
    Transient,
    /// Non-retryable failure (authentication, validation, hash mismatch).
    Permanent,
    /// Attempt cut short by run abort.
    Cancelled,
}

/// Per-stage outcome counters carried by stage resolution events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Targets in the stage.
    pub total: u64,
    /// Completed targets.
    pub completed: u64,
    /// Failed targets.
    pub failed: u64,
    /// Skipped targets.
    pub skipped: u64,
    /// `failed / total`.
    pub failure_ratio: f64,
    /// Threshold the ratio was compared against.
    pub failure_threshold: f64,
}

/// Tagged event payload; the tag doubles as the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run started.
    RunStarted {
        /// Actor that started the run.
        started_by: String,
        /// Whether appliers run in dry-run mode.
        dry_run: bool,
    },
    /// Run paused.
    RunPaused {
        /// Actor that paused the run.
        requested_by: String,
    },
    /// Run resumed.
    RunResumed {
        /// Actor that resumed the run.
        requested_by: String,
    },
    /// Run aborted.
    RunAborted {
        /// Actor that aborted the run.
        requested_by: String,
        /// Pending targets moved to skipped by the abort.
        skipped_targets: u64,
    },
    /// Stage dispatch began.
    StageStarted {
        /// Stage sequencing value.
        sequencing: i64,
        /// Stage name.
        name: String,
        /// Pending targets at dispatch start.
        pending_targets: u64,
    },
    /// Stage resolved within threshold.
    StageCompleted {
        /// Stage outcome counters.
        #[serde(flatten)]
        outcome: StageOutcome,
    },
    /// Stage exceeded threshold.
    StageFailed {
        /// Stage outcome counters.
        #[serde(flatten)]
        outcome: StageOutcome,
    },
    /// Apply attempt started.
    ApplyStarted {
        /// Router hostname.
        hostname: String,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Apply verified.
    ApplySucceeded {
        /// Router hostname.
        hostname: String,
        /// Verified policy hash.
        policy_hash: HashDigest,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Apply attempt failed.
    ApplyFailed {
        /// Router hostname.
        hostname: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Failure classification.
        error_kind: ApplyErrorKind,
        /// Failure message.
        message: String,
        /// True when another attempt follows.
        will_retry: bool,
    },
    /// Safety gate blocked dispatch.
    SafetyGateBlocked {
        /// Gate-provided reason.
        reason: String,
    },
    /// Operator overrode the gate.
    SafetyGateOverridden {
        /// Actor that recorded the override.
        overridden_by: String,
        /// Operator-provided justification.
        reason: String,
    },
}

impl EventPayload {
    /// Returns the event type for this payload.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted {
                ..
            } => EventType::RunStarted,
            Self::RunPaused {
                ..
            } => EventType::RunPaused,
            Self::RunResumed {
                ..
            } => EventType::RunResumed,
            Self::RunAborted {
                ..
            } => EventType::RunAborted,
            Self::StageStarted {
                ..
            } => EventType::StageStarted,
            Self::StageCompleted {
                ..
            } => EventType::StageCompleted,
            Self::StageFailed {
                ..
            } => EventType::StageFailed,
            Self::ApplyStarted {
                ..
            } => EventType::ApplyStarted,
            Self::ApplySucceeded {
                ..
            } => EventType::ApplySucceeded,
            Self::ApplyFailed {
                ..
            } => EventType::ApplyFailed,
            Self::SafetyGateBlocked {
                ..
            } => EventType::SafetyGateBlocked,
            Self::SafetyGateOverridden {
                ..
            } => EventType::SafetyGateOverridden,
        }
    }
}

// ============================================================================
// SECTION: Event Records
// ============================================================================

/// Event awaiting an identifier from the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Owning run.
    pub run_id: RunId,
    /// Related stage, if any.
    pub stage_id: Option<StageId>,
    /// Related target, if any.
    pub target_id: Option<TargetId>,
    /// Requested timestamp; the store may clamp it forward.
    pub timestamp: Timestamp,
    /// Typed payload.
    pub payload: EventPayload,
}

impl NewEvent {
    /// Creates a run-scoped event.
    #[must_use]
    pub const fn for_run(run_id: RunId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            run_id,
            stage_id: None,
            target_id: None,
            timestamp,
            payload,
        }
    }

    /// Attaches a stage reference.
    #[must_use]
    pub fn with_stage(mut self, stage_id: StageId) -> Self {
        self.stage_id = Some(stage_id);
        self
    }

    /// Attaches a target reference.
    #[must_use]
    pub fn with_target(mut self, target_id: TargetId) -> Self {
        self.target_id = Some(target_id);
        self
    }
}

/// Persisted lifecycle event.
///
/// # Invariants
/// - Timestamps are non-decreasing within a run in `event_id` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEvent {
    /// Store-assigned identifier.
    pub event_id: EventId,
    /// Owning run.
    pub run_id: RunId,
    /// Related stage, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stage_id: Option<StageId>,
    /// Related target, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<TargetId>,
    /// Event timestamp.
    pub timestamp: Timestamp,
    /// Typed payload.
    pub payload: EventPayload,
}

impl RolloutEvent {
    /// Builds a persisted event from its pending form.
    #[must_use]
    pub fn from_new(event_id: EventId, timestamp: Timestamp, event: NewEvent) -> Self {
        Self {
            event_id,
            run_id: event.run_id,
            stage_id: event.stage_id,
            target_id: event.target_id,
            timestamp,
            payload: event.payload,
        }
    }

    /// Returns the event type.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Event listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Run whose events are listed.
    pub run_id: RunId,
    /// Restrict to one stage.
    pub stage_id: Option<StageId>,
    /// Restrict to one event type.
    pub event_type: Option<EventType>,
    /// Maximum events returned, newest first.
    pub limit: usize,
}

impl EventQuery {
    /// Lists the newest `limit` events of a run.
    #[must_use]
    pub const fn recent(run_id: RunId, limit: usize) -> Self {
        Self {
            run_id,
            stage_id: None,
            event_type: None,
            limit,
        }
    }

    /// Restricts the query to a stage.
    #[must_use]
    pub fn in_stage(mut self, stage_id: StageId) -> Self {
        self.stage_id = Some(stage_id);
        self
    }

    /// Restricts the query to an event type.
    #[must_use]
    pub const fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Returns true when `event` passes the filters (limit excluded).
    #[must_use]
    pub fn matches(&self, event: &RolloutEvent) -> bool {
        event.run_id == self.run_id
            && self.stage_id.as_ref().is_none_or(|stage| event.stage_id.as_ref() == Some(stage))
            && self.event_type.is_none_or(|kind| event.event_type() == kind)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
