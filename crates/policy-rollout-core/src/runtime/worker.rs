// crates/policy-rollout-core/src/runtime/worker.rs
// ============================================================================
// Module: Policy Rollout Target Worker
// Description: Applies one target's policy with deadline, retry, and verification.
// Purpose: Drive a claimed target to a terminal state exactly once.
// Dependencies: crate::{core, interfaces, runtime}, thiserror, tokio, tracing
// ============================================================================

//! ## Overview
//! A worker only ever runs against a target its caller has already moved to
//! `in_progress`. Every write it makes is conditional on that state, so a
//! worker that somehow lost ownership stops instead of racing another one.
//!
//! Outcome rules:
//! - Success requires the device-reported hash to equal the planned hash.
//! - Transient failures (including deadline expiry) retry with backoff.
//! - Permanent failures and cancellation fail the target immediately.
//! - A target cancelled before its first attempt is skipped, not failed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::core::Clock;
use crate::core::EventPayload;
use crate::core::HashDigest;
use crate::core::NewEvent;
use crate::core::RolloutTarget;
use crate::core::TargetId;
use crate::core::TargetMutation;
use crate::core::TargetState;
use crate::interfaces::ApplyError;
use crate::interfaces::ApplyRequest;
use crate::interfaces::CancelSignal;
use crate::interfaces::PolicyApplier;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;
use crate::runtime::recorder::EventRecorder;
use crate::runtime::retry::RetryPolicy;
use crate::runtime::retry::retry_on_conflict;
use crate::runtime::store::SharedStateStore;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default bounded deadline per apply call.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Target worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Transient failure retry policy.
    pub retry: RetryPolicy,
    /// Deadline applied to every apply call.
    pub apply_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Terminal result of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    /// Target identifier.
    pub target_id: TargetId,
    /// Terminal state written.
    pub state: TargetState,
    /// Verified policy hash on success.
    pub policy_hash: Option<HashDigest>,
    /// Error recorded on failure.
    pub error: Option<String>,
}

/// Worker failures that prevented a terminal write.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Target was not `in_progress` when the worker tried to write.
    #[error("target {0} is not owned by this worker")]
    NotOwned(TargetId),
    /// Store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// Applies policy for claimed targets.
#[derive(Clone)]
pub struct TargetWorker {
    /// Backing store.
    store: SharedStateStore,
    /// Event recorder.
    recorder: EventRecorder,
    /// Device collaborator.
    applier: Arc<dyn PolicyApplier>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Retry and deadline settings.
    config: WorkerConfig,
}

impl TargetWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        store: SharedStateStore,
        recorder: EventRecorder,
        applier: Arc<dyn PolicyApplier>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            recorder,
            applier,
            clock,
            config,
        }
    }

    /// Applies `target`, which the caller must already hold `in_progress`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotOwned`] when the target left `in_progress`
    /// underneath the worker, or [`WorkerError::Store`] when persistence
    /// fails. The target may then still be `in_progress`.
    pub async fn apply(
        &self,
        target: RolloutTarget,
        dry_run: bool,
        mut cancel: CancelSignal,
    ) -> Result<TargetOutcome, WorkerError> {
        if cancel.is_cancelled() {
            return self.skip_unstarted(&target).await;
        }
        let Some(artifact) = self.store.load_artifact(&target.target_id)? else {
            let error = ApplyError::Permanent("policy artifact missing from store".to_string());
            return self.finish_failed(&target, target.attempt_count, &error).await;
        };

        let mut attempt = target.attempt_count;
        loop {
            let started = self.write(TargetMutation::begin_attempt(
                target.target_id.clone(),
                self.clock.now(),
            ));
            if !retry_on_conflict(started).await? {
                return Err(WorkerError::NotOwned(target.target_id.clone()));
            }
            attempt = attempt.saturating_add(1);
            self.emit(
                &target,
                EventPayload::ApplyStarted {
                    hostname: target.hostname.clone(),
                    attempt,
                },
            )
            .await?;

            let request = ApplyRequest {
                target_id: target.target_id.clone(),
                hostname: target.hostname.clone(),
                artifact: artifact.clone(),
                dry_run,
                deadline: self.config.apply_timeout,
            };
            let result = tokio::time::timeout(
                self.config.apply_timeout,
                self.applier.apply(request, cancel.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ApplyError::Transient(format!(
                    "apply deadline of {}ms exceeded",
                    self.config.apply_timeout.as_millis()
                )))
            });

            let error = match result {
                Ok(receipt) if receipt.policy_hash == target.planned_hash => {
                    return self.finish_completed(&target, receipt.policy_hash, attempt).await;
                }
                Ok(receipt) => ApplyError::Permanent(format!(
                    "policy hash mismatch: planned {}, device reported {}",
                    target.planned_hash, receipt.policy_hash
                )),
                Err(err) => err,
            };

            let retryable = matches!(error, ApplyError::Transient(_))
                && self.config.retry.allows_retry_after(attempt)
                && !cancel.is_cancelled();
            if !retryable {
                return self.finish_failed(&target, attempt, &error).await;
            }

            let noted = self.write(TargetMutation::note_error(
                target.target_id.clone(),
                error.to_string(),
                self.clock.now(),
            ));
            if !retry_on_conflict(noted).await? {
                return Err(WorkerError::NotOwned(target.target_id.clone()));
            }
            self.emit(&target, failed_payload(&target, attempt, &error, true)).await?;
            let delay = self.config.retry.backoff_after(attempt);
            warn!(
                target_id = %target.target_id,
                hostname = %target.hostname,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "transient apply failure; retrying"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return self.finish_failed(&target, attempt, &ApplyError::Cancelled).await;
                }
            }
        }
    }

    /// Writes the completed state and emits `apply_succeeded`.
    async fn finish_completed(
        &self,
        target: &RolloutTarget,
        policy_hash: HashDigest,
        attempt: u32,
    ) -> Result<TargetOutcome, WorkerError> {
        let completed = self.write(TargetMutation::complete(
            target.target_id.clone(),
            policy_hash.clone(),
            self.clock.now(),
        ));
        if !retry_on_conflict(completed).await? {
            return Err(WorkerError::NotOwned(target.target_id.clone()));
        }
        self.emit(
            target,
            EventPayload::ApplySucceeded {
                hostname: target.hostname.clone(),
                policy_hash: policy_hash.clone(),
                attempt,
            },
        )
        .await?;
        info!(
            target_id = %target.target_id,
            hostname = %target.hostname,
            attempt,
            "policy applied"
        );
        Ok(TargetOutcome {
            target_id: target.target_id.clone(),
            state: TargetState::Completed,
            policy_hash: Some(policy_hash),
            error: None,
        })
    }

    /// Writes the failed state and emits the final `apply_failed`.
    async fn finish_failed(
        &self,
        target: &RolloutTarget,
        attempt: u32,
        error: &ApplyError,
    ) -> Result<TargetOutcome, WorkerError> {
        let message = error.to_string();
        let failed =
            self.write(TargetMutation::fail(target.target_id.clone(), &message, self.clock.now()));
        if !retry_on_conflict(failed).await? {
            return Err(WorkerError::NotOwned(target.target_id.clone()));
        }
        self.emit(target, failed_payload(target, attempt, error, false)).await?;
        warn!(
            target_id = %target.target_id,
            hostname = %target.hostname,
            attempt,
            error = %message,
            "target failed"
        );
        Ok(TargetOutcome {
            target_id: target.target_id.clone(),
            state: TargetState::Failed,
            policy_hash: None,
            error: Some(message),
        })
    }

    /// Releases a target claimed after cancellation without attempting it.
    async fn skip_unstarted(&self, target: &RolloutTarget) -> Result<TargetOutcome, WorkerError> {
        let skipped = self.write(TargetMutation::transition(
            target.target_id.clone(),
            TargetState::InProgress,
            TargetState::Skipped,
            self.clock.now(),
        ));
        if !retry_on_conflict(skipped).await? {
            return Err(WorkerError::NotOwned(target.target_id.clone()));
        }
        Ok(TargetOutcome {
            target_id: target.target_id.clone(),
            state: TargetState::Skipped,
            policy_hash: None,
            error: None,
        })
    }

    /// Returns a retryable closure applying `mutation`.
    fn write(&self, mutation: TargetMutation) -> impl FnMut() -> Result<bool, StoreError> + '_ {
        move || self.store.update_target(&mutation)
    }

    /// Emits a target-scoped event.
    async fn emit(&self, target: &RolloutTarget, payload: EventPayload) -> Result<(), StoreError> {
        let event = NewEvent::for_run(target.run_id.clone(), self.clock.now(), payload)
            .with_stage(target.stage_id.clone())
            .with_target(target.target_id.clone());
        retry_on_conflict(|| self.recorder.append(event.clone())).await.map(|_| ())
    }
}

/// Builds an `apply_failed` payload.
fn failed_payload(
    target: &RolloutTarget,
    attempt: u32,
    error: &ApplyError,
    will_retry: bool,
) -> EventPayload {
    EventPayload::ApplyFailed {
        hostname: target.hostname.clone(),
        attempt,
        error_kind: error.kind(),
        message: error.to_string(),
        will_retry,
    }
}
