// crates/policy-rollout-core/src/runtime/executor.rs
// ============================================================================
// Module: Policy Rollout Stage Executor
// Description: Per-run control tasks, operator controls, and restart recovery.
// Purpose: Drive each run's stages in order with bounded target concurrency.
// Dependencies: crate::{core, interfaces, runtime}, thiserror, tokio, tracing
// ============================================================================

//! ## Overview
//! [`RolloutExecutor`] owns one control task per active run, registered in a
//! [`RunRegistry`] keyed by run identifier. For every stage, in ascending
//! sequencing, the task:
//! 1. waits on the safety gate (first dispatch only; overrides bypass it),
//! 2. claims `pending` targets with the store's conditional transition and
//!    hands each to a [`TargetWorker`], never more than `max_concurrency` at once,
//! 3. resolves the stage against its failure threshold once every target is terminal.
//!
//! Pausing stops new claims and lets in-flight workers finish. Aborting
//! claims the run's terminal status first, then cancels in-flight workers
//! (best effort) and skips every pending target; the control task exits once
//! the workers drain. All state lives in the store,
//! so [`RolloutExecutor::recover`] can rebuild every run after a restart.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::core::ApplyErrorKind;
use crate::core::Clock;
use crate::core::EventPayload;
use crate::core::EventQuery;
use crate::core::EventType;
use crate::core::FailureThreshold;
use crate::core::NewEvent;
use crate::core::RolloutEvent;
use crate::core::RolloutRequest;
use crate::core::RolloutRun;
use crate::core::RolloutStage;
use crate::core::RolloutTarget;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::StageId;
use crate::core::StageOutcome;
use crate::core::StageStats;
use crate::core::SystemClock;
use crate::core::TargetMutation;
use crate::core::TargetState;
use crate::interfaces::EventSink;
use crate::interfaces::GateContext;
use crate::interfaces::GateDecision;
use crate::interfaces::PolicyApplier;
use crate::interfaces::SafetyGate;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;
use crate::runtime::gate::OpenGate;
use crate::runtime::planner::PlannerError;
use crate::runtime::planner::RolloutPlanner;
use crate::runtime::planner::ValidationError;
use crate::runtime::recorder::EventRecorder;
use crate::runtime::recorder::NoopEventSink;
use crate::runtime::registry::RunHandle;
use crate::runtime::registry::RunRegistry;
use crate::runtime::retry::retry_on_conflict;
use crate::runtime::store::SharedStateStore;
use crate::runtime::worker::TargetOutcome;
use crate::runtime::worker::TargetWorker;
use crate::runtime::worker::WorkerConfig;
use crate::runtime::worker::WorkerError;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default per-stage worker bound.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
/// Default delay between safety gate re-checks while blocked.
pub const DEFAULT_GATE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Error text recorded on targets whose worker did not survive.
const INTERRUPTED_ERROR: &str = "apply interrupted before reaching a terminal state";
/// Actor recorded on `run_aborted` events written during recovery.
const RECOVERY_ACTOR: &str = "recovery";

/// Executor configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum in-flight workers per stage.
    pub max_concurrency: usize,
    /// Run threshold used when a request does not set one.
    pub failure_threshold: FailureThreshold,
    /// Delay between safety gate re-checks while blocked.
    pub gate_recheck_interval: Duration,
    /// Worker retry and deadline settings.
    pub worker: WorkerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            failure_threshold: FailureThreshold::STRICT,
            gate_recheck_interval: DEFAULT_GATE_RECHECK_INTERVAL,
            worker: WorkerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Validates bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConfig`] when a bound is zero.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.max_concurrency == 0 {
            return Err(ExecutorError::InvalidConfig("max_concurrency must be > 0".to_string()));
        }
        if self.worker.retry.max_attempts == 0 {
            return Err(ExecutorError::InvalidConfig("max_attempts must be >= 1".to_string()));
        }
        if self.worker.apply_timeout.is_zero() {
            return Err(ExecutorError::InvalidConfig("apply_timeout must be > 0".to_string()));
        }
        if self.gate_recheck_interval.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "gate_recheck_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Operator control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOperation {
    /// Start a planned run.
    Start,
    /// Pause an active run.
    Pause,
    /// Resume a paused run.
    Resume,
    /// Abort a run.
    Abort,
    /// Override a blocking safety gate.
    OverrideGate,
}

impl fmt::Display for RunOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Abort => "abort",
            Self::OverrideGate => "override the safety gate of",
        })
    }
}

/// Control operation failures.
#[derive(Debug, Error)]
pub enum ExecutorError {
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
    /// Operation is illegal in the run's current status.
    #[error("cannot {operation} run {run_id} in status {status}")]
    InvalidTransition {
        /// Run identifier.
        run_id: RunId,
        /// Current status.
        status: RunStatus,
        /// Requested operation.
        operation: RunOperation,
    },
    /// Run is not terminal and no control task owns it.
    #[error("run {run_id} is {status} and has no control task")]
    NotRunning {
        /// Run identifier.
        run_id: RunId,
        /// Current status.
        status: RunStatus,
    },
    /// Executor configuration is invalid.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
    /// Rollout request rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PlannerError> for ExecutorError {
    fn from(err: PlannerError) -> Self {
        match err {
            PlannerError::Validation(err) => Self::Validation(err),
            PlannerError::Store(err) => Self::Store(err),
        }
    }
}

/// Builds an [`ExecutorError::InvalidTransition`].
fn invalid(run_id: &RunId, status: RunStatus, operation: RunOperation) -> ExecutorError {
    ExecutorError::InvalidTransition {
        run_id: run_id.clone(),
        status,
        operation,
    }
}

// ============================================================================
// SECTION: Builder
// ============================================================================

/// Builder for [`RolloutExecutor`].
pub struct RolloutExecutorBuilder {
    /// Backing store.
    store: SharedStateStore,
    /// Device collaborator.
    applier: Arc<dyn PolicyApplier>,
    /// Pre-stage gate.
    gate: Arc<dyn SafetyGate>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Audit mirror.
    sink: Arc<dyn EventSink>,
    /// Executor settings.
    config: ExecutorConfig,
}

impl RolloutExecutorBuilder {
    /// Sets the safety gate (default: [`OpenGate`]).
    #[must_use]
    pub fn safety_gate(mut self, gate: Arc<dyn SafetyGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Sets the clock (default: [`SystemClock`]).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the audit mirror (default: [`NoopEventSink`]).
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the executor configuration.
    #[must_use]
    pub const fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the executor.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConfig`] when the configuration is invalid.
    pub fn build(self) -> Result<RolloutExecutor, ExecutorError> {
        self.config.validate()?;
        let recorder = EventRecorder::new(self.store.clone(), self.sink);
        let planner = RolloutPlanner::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.config.failure_threshold,
        );
        let worker = TargetWorker::new(
            self.store.clone(),
            recorder.clone(),
            self.applier,
            Arc::clone(&self.clock),
            self.config.worker,
        );
        Ok(RolloutExecutor {
            inner: Arc::new(ExecutorInner {
                store: self.store,
                recorder,
                planner,
                worker,
                gate: self.gate,
                clock: self.clock,
                config: self.config,
                registry: RunRegistry::new(),
            }),
        })
    }
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Runs restored by [`RolloutExecutor::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs whose control task was respawned.
    pub resumed: Vec<RunId>,
    /// Runs finalized as aborted from stored evidence.
    pub aborted: Vec<RunId>,
    /// Targets moved from `in_progress` to `failed`.
    pub interrupted_targets: u64,
}

/// Stage executor and run registry.
#[derive(Clone)]
pub struct RolloutExecutor {
    /// Shared executor state.
    inner: Arc<ExecutorInner>,
}

impl RolloutExecutor {
    /// Starts building an executor.
    #[must_use]
    pub fn builder(
        store: SharedStateStore,
        applier: Arc<dyn PolicyApplier>,
    ) -> RolloutExecutorBuilder {
        RolloutExecutorBuilder {
            store,
            applier,
            gate: Arc::new(OpenGate),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
            config: ExecutorConfig::default(),
        }
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &SharedStateStore {
        &self.inner.store
    }

    /// Returns runs with a live control task in this process.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        self.inner.registry.active_runs()
    }

    /// Validates a request and writes the run in `planning` status.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Validation`] for malformed requests and
    /// [`ExecutorError::Store`] when persistence fails.
    pub fn create_run(&self, request: &RolloutRequest) -> Result<RolloutRun, ExecutorError> {
        Ok(self.inner.planner.create_run(request)?)
    }

    /// Moves a planned run to active and spawns its control task.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidTransition`] unless the run is planning.
    pub async fn start(&self, run_id: &RunId, actor: &str) -> Result<RolloutRun, ExecutorError> {
        let run = self.inner.require_run(run_id)?;
        if run.status != RunStatus::Planning {
            return Err(invalid(run_id, run.status, RunOperation::Start));
        }
        if !self.inner.transition_run(run_id, &[RunStatus::Planning], RunStatus::Active).await? {
            let current = self.inner.require_run(run_id)?;
            return Err(invalid(run_id, current.status, RunOperation::Start));
        }
        self.inner
            .emit(NewEvent::for_run(
                run_id.clone(),
                self.inner.clock.now(),
                EventPayload::RunStarted {
                    started_by: actor.to_string(),
                    dry_run: run.dry_run,
                },
            ))
            .await?;
        info!(run_id = %run_id, actor, dry_run = run.dry_run, "rollout run started");
        self.spawn_control_task(run_id);
        self.inner.require_run(run_id)
    }

    /// Pauses an active run; pausing a paused run is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidTransition`] for planning or terminal runs.
    pub async fn pause(&self, run_id: &RunId, actor: &str) -> Result<RolloutRun, ExecutorError> {
        let run = self.inner.require_run(run_id)?;
        match run.status {
            RunStatus::Paused => return Ok(run),
            RunStatus::Active => {}
            status => return Err(invalid(run_id, status, RunOperation::Pause)),
        }
        if self.inner.transition_run(run_id, &[RunStatus::Active], RunStatus::Paused).await? {
            self.inner
                .emit(NewEvent::for_run(
                    run_id.clone(),
                    self.inner.clock.now(),
                    EventPayload::RunPaused {
                        requested_by: actor.to_string(),
                    },
                ))
                .await?;
            info!(run_id = %run_id, actor, "rollout run paused");
            self.wake(run_id);
        }
        let current = self.inner.require_run(run_id)?;
        if current.status == RunStatus::Paused {
            Ok(current)
        } else {
            Err(invalid(run_id, current.status, RunOperation::Pause))
        }
    }

    /// Resumes a paused run; resuming an active run is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidTransition`] for planning or terminal runs.
    pub async fn resume(&self, run_id: &RunId, actor: &str) -> Result<RolloutRun, ExecutorError> {
        let run = self.inner.require_run(run_id)?;
        match run.status {
            RunStatus::Active => return Ok(run),
            RunStatus::Paused => {}
            status => return Err(invalid(run_id, status, RunOperation::Resume)),
        }
        if self.inner.transition_run(run_id, &[RunStatus::Paused], RunStatus::Active).await? {
            self.inner
                .emit(NewEvent::for_run(
                    run_id.clone(),
                    self.inner.clock.now(),
                    EventPayload::RunResumed {
                        requested_by: actor.to_string(),
                    },
                ))
                .await?;
            info!(run_id = %run_id, actor, "rollout run resumed");
            if !self.spawn_control_task(run_id) {
                self.wake(run_id);
            }
        }
        let current = self.inner.require_run(run_id)?;
        if current.status == RunStatus::Active {
            Ok(current)
        } else {
            Err(invalid(run_id, current.status, RunOperation::Resume))
        }
    }

    /// Aborts a run: cancels in-flight workers and skips every pending target.
    ///
    /// Aborting an aborted run is a no-op. The run is moved to `aborted`
    /// before any target is touched, so an abort racing a run that resolves
    /// on its own either wins outright or fails with the resolved status.
    /// In-flight workers still finish to their own terminal state; use
    /// [`RolloutExecutor::wait`] to observe the drained run.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidTransition`] for completed or failed runs.
    pub async fn abort(&self, run_id: &RunId, actor: &str) -> Result<RolloutRun, ExecutorError> {
        loop {
            let run = self.inner.require_run(run_id)?;
            match run.status {
                RunStatus::Aborted => return Ok(run),
                RunStatus::Completed | RunStatus::Failed => {
                    return Err(invalid(run_id, run.status, RunOperation::Abort));
                }
                RunStatus::Planning => {
                    if !self
                        .inner
                        .transition_run(run_id, &[RunStatus::Planning], RunStatus::Aborted)
                        .await?
                    {
                        continue;
                    }
                    self.inner.skip_pending_and_record(run_id, actor).await?;
                    return self.inner.require_run(run_id);
                }
                RunStatus::Active | RunStatus::Paused => {
                    // The status write is the commit point; a control task
                    // that resolves first wins and the loop reports its status.
                    if !self
                        .inner
                        .transition_run(
                            run_id,
                            &[RunStatus::Active, RunStatus::Paused],
                            RunStatus::Aborted,
                        )
                        .await?
                    {
                        continue;
                    }
                    let handle = self.inner.registry.get(run_id);
                    if let Some(handle) = &handle {
                        handle.cancel();
                    }
                    self.inner.skip_pending_and_record(run_id, actor).await?;
                    if handle.is_none() {
                        self.inner.fail_in_progress(run_id).await?;
                    }
                    return self.inner.require_run(run_id);
                }
            }
        }
    }

    /// Records an operator override for a stage's safety gate.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::StageNotFound`] when the stage is not part of
    /// the run and [`ExecutorError::InvalidTransition`] for terminal runs.
    pub async fn override_gate(
        &self,
        run_id: &RunId,
        stage_id: &StageId,
        actor: &str,
        reason: &str,
    ) -> Result<RolloutEvent, ExecutorError> {
        let run = self.inner.require_run(run_id)?;
        if run.status.is_terminal() {
            return Err(invalid(run_id, run.status, RunOperation::OverrideGate));
        }
        let stages = self.inner.store.list_stages(run_id)?;
        if !stages.iter().any(|stage| &stage.stage_id == stage_id) {
            return Err(ExecutorError::StageNotFound {
                run_id: run_id.clone(),
                stage_id: stage_id.clone(),
            });
        }
        let event = self
            .inner
            .emit(
                NewEvent::for_run(
                    run_id.clone(),
                    self.inner.clock.now(),
                    EventPayload::SafetyGateOverridden {
                        overridden_by: actor.to_string(),
                        reason: reason.to_string(),
                    },
                )
                .with_stage(stage_id.clone()),
            )
            .await?;
        info!(run_id = %run_id, stage_id = %stage_id, actor, "safety gate overridden");
        self.wake(run_id);
        Ok(event)
    }

    /// Waits until the run's control task finishes and returns the final status.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::NotRunning`] when the run is not terminal and
    /// no control task owns it.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus, ExecutorError> {
        let finished = self.inner.registry.get(run_id).map(|handle| handle.subscribe());
        if let Some(mut finished) = finished {
            let status = finished.wait_for(Option::is_some).await.ok().and_then(|status| *status);
            if let Some(status) = status {
                return Ok(status);
            }
        }
        let run = self.inner.require_run(run_id)?;
        if run.status.is_terminal() {
            Ok(run.status)
        } else {
            Err(ExecutorError::NotRunning {
                run_id: run_id.clone(),
                status: run.status,
            })
        }
    }

    /// Rebuilds orchestration state after a process restart.
    ///
    /// Targets left `in_progress` are failed, runs with abort evidence are
    /// finalized as aborted, and every other active or paused run gets a
    /// fresh control task. Aborted runs whose abort was cut short get their
    /// pending targets skipped and a `run_aborted` event if none was written.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Store`] when the store fails.
    pub async fn recover(&self) -> Result<RecoveryReport, ExecutorError> {
        let mut report = RecoveryReport::default();
        for status in [RunStatus::Active, RunStatus::Paused] {
            for run in self.inner.store.list_runs(Some(status), usize::MAX)? {
                let run_id = run.run_id;
                if self.inner.registry.get(&run_id).is_some() {
                    continue;
                }
                report.interrupted_targets += self.inner.fail_in_progress(&run_id).await?;
                if self.inner.has_abort_evidence(&run_id)? {
                    let at = self.inner.clock.now();
                    retry_on_conflict(|| self.inner.store.skip_pending_targets(&run_id, at))
                        .await?;
                    self.inner
                        .transition_run(
                            &run_id,
                            &[RunStatus::Active, RunStatus::Paused],
                            RunStatus::Aborted,
                        )
                        .await?;
                    info!(run_id = %run_id, "recovered aborted rollout run");
                    report.aborted.push(run_id);
                } else if self.spawn_control_task(&run_id) {
                    info!(run_id = %run_id, status = %status, "resumed rollout run after restart");
                    report.resumed.push(run_id);
                }
            }
        }
        for run in self.inner.store.list_runs(Some(RunStatus::Aborted), usize::MAX)? {
            let run_id = run.run_id;
            if self.inner.registry.get(&run_id).is_some() {
                continue;
            }
            let unfinished = self.inner.store.run_stage_stats(&run_id)?.iter().any(|stage| {
                stage.stats.pending > 0 || stage.stats.in_progress > 0
            });
            if !unfinished && self.inner.has_abort_event(&run_id)? {
                continue;
            }
            report.interrupted_targets += self.inner.fail_in_progress(&run_id).await?;
            if self.inner.has_abort_event(&run_id)? {
                let at = self.inner.clock.now();
                retry_on_conflict(|| self.inner.store.skip_pending_targets(&run_id, at)).await?;
            } else {
                self.inner.skip_pending_and_record(&run_id, RECOVERY_ACTOR).await?;
            }
            info!(run_id = %run_id, "completed interrupted abort");
            report.aborted.push(run_id);
        }
        Ok(report)
    }

    /// Spawns a control task unless one is already registered.
    fn spawn_control_task(&self, run_id: &RunId) -> bool {
        let Some(handle) = self.inner.registry.register(run_id) else {
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            inner.run_control_task(run_id, handle).await;
        });
        true
    }

    /// Wakes a run's control task if one is live.
    fn wake(&self, run_id: &RunId) {
        if let Some(handle) = self.inner.registry.get(run_id) {
            handle.wake();
        }
    }
}

// ============================================================================
// SECTION: Control Task
// ============================================================================

/// How a stage left the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageResult {
    /// Stage resolved within its threshold.
    Passed,
    /// Stage exceeded its threshold.
    Failed,
    /// Run was aborted during the stage.
    Aborted,
    /// Run reached a status the control task does not drive.
    Halted(RunStatus),
}

/// State shared by the executor handle and its control tasks.
struct ExecutorInner {
    /// Backing store.
    store: SharedStateStore,
    /// Event recorder.
    recorder: EventRecorder,
    /// Request planner.
    planner: RolloutPlanner,
    /// Target worker template.
    worker: TargetWorker,
    /// Pre-stage gate.
    gate: Arc<dyn SafetyGate>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Executor settings.
    config: ExecutorConfig,
    /// Live control tasks.
    registry: RunRegistry,
}

impl ExecutorInner {
    /// Drives a run to completion and publishes its final status.
    async fn run_control_task(self: Arc<Self>, run_id: RunId, handle: Arc<RunHandle>) {
        let status = match self.drive(&run_id, &handle).await {
            Ok(status) => {
                info!(run_id = %run_id, status = %status, "rollout control task finished");
                Some(status).filter(|status| status.is_terminal())
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "rollout control task stopped");
                None
            }
        };
        handle.finish(status);
        self.registry.remove(&run_id);
    }

    /// Runs each stage in ascending sequencing.
    async fn drive(&self, run_id: &RunId, handle: &RunHandle) -> Result<RunStatus, ExecutorError> {
        let stages = self.store.list_stages(run_id)?;
        for stage in &stages {
            match self.run_stage(run_id, stage, handle).await? {
                StageResult::Passed => {}
                StageResult::Failed => return self.finalize(run_id, RunStatus::Failed).await,
                StageResult::Aborted => return self.finalize(run_id, RunStatus::Aborted).await,
                StageResult::Halted(status) => return Ok(status),
            }
        }
        self.finalize(run_id, RunStatus::Completed).await
    }

    /// Moves a non-terminal run to its terminal status.
    async fn finalize(&self, run_id: &RunId, to: RunStatus) -> Result<RunStatus, ExecutorError> {
        if self.transition_run(run_id, &[RunStatus::Active, RunStatus::Paused], to).await? {
            info!(run_id = %run_id, status = %to, "rollout run resolved");
            return Ok(to);
        }
        Ok(self.require_run(run_id)?.status)
    }

    /// Gates, dispatches, and resolves one stage.
    async fn run_stage(
        &self,
        run_id: &RunId,
        stage: &RolloutStage,
        handle: &RunHandle,
    ) -> Result<StageResult, ExecutorError> {
        if !self.stage_has_event(run_id, &stage.stage_id, EventType::StageStarted)? {
            if let Some(result) = self.await_gate(run_id, stage, handle).await? {
                return Ok(result);
            }
            let pending = StageStats::from_targets(&self.store.list_targets(&stage.stage_id)?)
                .pending;
            self.emit(
                NewEvent::for_run(
                    run_id.clone(),
                    self.clock.now(),
                    EventPayload::StageStarted {
                        sequencing: stage.sequencing,
                        name: stage.name.clone(),
                        pending_targets: pending,
                    },
                )
                .with_stage(stage.stage_id.clone()),
            )
            .await?;
            info!(run_id = %run_id, stage_id = %stage.stage_id, pending, "stage started");
        }

        let mut in_flight = JoinSet::new();
        let dispatched = self.dispatch(run_id, stage, handle, &mut in_flight).await;
        while let Some(joined) = in_flight.join_next().await {
            observe_worker(&stage.stage_id, joined);
        }
        if let Some(result) = dispatched? {
            return Ok(result);
        }
        self.resolve_stage(run_id, stage, handle).await
    }

    /// Blocks until the safety gate clears, is overridden, or the run stops.
    ///
    /// Returns `None` when dispatch may begin.
    async fn await_gate(
        &self,
        run_id: &RunId,
        stage: &RolloutStage,
        handle: &RunHandle,
    ) -> Result<Option<StageResult>, ExecutorError> {
        let mut last_reason: Option<String> = None;
        loop {
            if handle.is_cancelled() {
                return Ok(Some(StageResult::Aborted));
            }
            match self.require_run(run_id)?.status {
                RunStatus::Active => {}
                RunStatus::Paused => {
                    handle.woken().await;
                    continue;
                }
                status => return Ok(Some(StageResult::Halted(status))),
            }
            if self.stage_has_event(run_id, &stage.stage_id, EventType::SafetyGateOverridden)? {
                return Ok(None);
            }
            let context = GateContext {
                run_id: run_id.clone(),
                stage_id: stage.stage_id.clone(),
                sequencing: stage.sequencing,
                stage_name: stage.name.clone(),
                now: self.clock.now(),
            };
            let GateDecision::Blocked {
                reason,
            } = self.gate.check(&context)
            else {
                return Ok(None);
            };
            if last_reason.as_deref() != Some(reason.as_str()) {
                warn!(run_id = %run_id, stage_id = %stage.stage_id, reason = %reason, "safety gate blocked stage");
                self.emit(
                    NewEvent::for_run(
                        run_id.clone(),
                        context.now,
                        EventPayload::SafetyGateBlocked {
                            reason: reason.clone(),
                        },
                    )
                    .with_stage(stage.stage_id.clone()),
                )
                .await?;
                last_reason = Some(reason);
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.gate_recheck_interval) => {}
                () = handle.woken() => {}
            }
        }
    }

    /// Claims pending targets and runs workers until the stage has none left.
    ///
    /// Returns `Some` when the run stopped before the stage could resolve.
    async fn dispatch(
        &self,
        run_id: &RunId,
        stage: &RolloutStage,
        handle: &RunHandle,
        in_flight: &mut JoinSet<Result<TargetOutcome, WorkerError>>,
    ) -> Result<Option<StageResult>, ExecutorError> {
        loop {
            if handle.is_cancelled() {
                return Ok(None);
            }
            let run = self.require_run(run_id)?;
            match run.status {
                RunStatus::Active => {
                    self.claim_targets(&run, stage, handle, in_flight).await?;
                    if in_flight.is_empty() {
                        return Ok(None);
                    }
                }
                RunStatus::Paused => {
                    if in_flight.is_empty() {
                        handle.woken().await;
                        continue;
                    }
                }
                status => return Ok(Some(StageResult::Halted(status))),
            }
            tokio::select! {
                Some(joined) = in_flight.join_next() => observe_worker(&stage.stage_id, joined),
                () = handle.woken() => {}
            }
        }
    }

    /// Claims pending targets up to the concurrency bound and spawns workers.
    async fn claim_targets(
        &self,
        run: &RolloutRun,
        stage: &RolloutStage,
        handle: &RunHandle,
        in_flight: &mut JoinSet<Result<TargetOutcome, WorkerError>>,
    ) -> Result<(), ExecutorError> {
        let capacity = self.config.max_concurrency.saturating_sub(in_flight.len());
        if capacity == 0 {
            return Ok(());
        }
        let pending = self
            .store
            .list_targets(&stage.stage_id)?
            .into_iter()
            .filter(|target| target.state == TargetState::Pending);
        let mut claimed = 0;
        for mut target in pending {
            if claimed == capacity || handle.is_cancelled() {
                break;
            }
            let at = self.clock.now();
            let won = retry_on_conflict(|| {
                self.store.try_transition(
                    &target.target_id,
                    TargetState::Pending,
                    TargetState::InProgress,
                    at,
                )
            })
            .await?;
            if !won {
                continue;
            }
            claimed += 1;
            target.state = TargetState::InProgress;
            target.updated_at = at;
            debug!(run_id = %run.run_id, target_id = %target.target_id, hostname = %target.hostname, "target claimed");
            let worker = self.worker.clone();
            let signal = handle.cancel_signal();
            let dry_run = run.dry_run;
            in_flight.spawn(async move { worker.apply(target, dry_run, signal).await });
        }
        Ok(())
    }

    /// Decides the stage outcome once dispatch has drained.
    async fn resolve_stage(
        &self,
        run_id: &RunId,
        stage: &RolloutStage,
        handle: &RunHandle,
    ) -> Result<StageResult, ExecutorError> {
        for target in self.store.list_targets(&stage.stage_id)? {
            if target.state == TargetState::InProgress {
                self.fail_target(&target).await?;
            }
        }
        let run = self.require_run(run_id)?;
        let stats = StageStats::from_targets(&self.store.list_targets(&stage.stage_id)?);
        if handle.is_cancelled() || stats.skipped > 0 {
            return Ok(StageResult::Aborted);
        }
        if run.status.is_terminal() || !stats.is_resolved() {
            return Ok(StageResult::Halted(run.status));
        }

        let threshold = stage.effective_threshold(&run);
        let outcome = StageOutcome {
            total: stats.total,
            completed: stats.completed,
            failed: stats.failed,
            skipped: stats.skipped,
            failure_ratio: stats.failure_ratio(),
            failure_threshold: threshold.get(),
        };
        let (result, event_type, payload) = if threshold.exceeded_by(stats.failed, stats.total) {
            warn!(
                run_id = %run_id,
                stage_id = %stage.stage_id,
                failed = stats.failed,
                total = stats.total,
                threshold = threshold.get(),
                "stage failed"
            );
            (StageResult::Failed, EventType::StageFailed, EventPayload::StageFailed {
                outcome,
            })
        } else {
            info!(
                run_id = %run_id,
                stage_id = %stage.stage_id,
                completed = stats.completed,
                failed = stats.failed,
                "stage completed"
            );
            (StageResult::Passed, EventType::StageCompleted, EventPayload::StageCompleted {
                outcome,
            })
        };
        if !self.stage_has_event(run_id, &stage.stage_id, event_type)? {
            self.emit(
                NewEvent::for_run(run_id.clone(), self.clock.now(), payload)
                    .with_stage(stage.stage_id.clone()),
            )
            .await?;
        }
        Ok(result)
    }

    /// Skips every pending target and records `run_aborted`.
    async fn skip_pending_and_record(&self, run_id: &RunId, actor: &str) -> Result<(), ExecutorError> {
        let at = self.clock.now();
        let skipped = retry_on_conflict(|| self.store.skip_pending_targets(run_id, at)).await?;
        self.emit(NewEvent::for_run(
            run_id.clone(),
            at,
            EventPayload::RunAborted {
                requested_by: actor.to_string(),
                skipped_targets: skipped,
            },
        ))
        .await?;
        info!(run_id = %run_id, actor, skipped, "rollout run aborted");
        Ok(())
    }

    /// Fails every `in_progress` target of a run, returning the count.
    async fn fail_in_progress(&self, run_id: &RunId) -> Result<u64, ExecutorError> {
        let mut failed = 0;
        for stage in self.store.list_stages(run_id)? {
            for target in self.store.list_targets(&stage.stage_id)? {
                if target.state == TargetState::InProgress && self.fail_target(&target).await? {
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    /// Fails an orphaned `in_progress` target and records `apply_failed`.
    async fn fail_target(&self, target: &RolloutTarget) -> Result<bool, ExecutorError> {
        let at = self.clock.now();
        let mutation = TargetMutation::fail(target.target_id.clone(), INTERRUPTED_ERROR, at);
        if !retry_on_conflict(|| self.store.update_target(&mutation)).await? {
            return Ok(false);
        }
        self.emit(
            NewEvent::for_run(
                target.run_id.clone(),
                at,
                EventPayload::ApplyFailed {
                    hostname: target.hostname.clone(),
                    attempt: target.attempt_count,
                    error_kind: ApplyErrorKind::Transient,
                    message: INTERRUPTED_ERROR.to_string(),
                    will_retry: false,
                },
            )
            .with_stage(target.stage_id.clone())
            .with_target(target.target_id.clone()),
        )
        .await?;
        warn!(target_id = %target.target_id, hostname = %target.hostname, "interrupted target failed");
        Ok(true)
    }

    /// Returns true when the run shows signs of an abort that never finalized.
    fn has_abort_evidence(&self, run_id: &RunId) -> Result<bool, ExecutorError> {
        let skipped = self.store.run_stage_stats(run_id)?.iter().any(|stage| stage.stats.skipped > 0);
        if skipped {
            return Ok(true);
        }
        self.has_abort_event(run_id)
    }

    /// Returns true when a `run_aborted` event was recorded for the run.
    fn has_abort_event(&self, run_id: &RunId) -> Result<bool, ExecutorError> {
        let query = EventQuery::recent(run_id.clone(), 1).of_type(EventType::RunAborted);
        Ok(!self.store.list_events(&query)?.is_empty())
    }

    /// Returns true when the stage has an event of `event_type`.
    fn stage_has_event(
        &self,
        run_id: &RunId,
        stage_id: &StageId,
        event_type: EventType,
    ) -> Result<bool, ExecutorError> {
        let query =
            EventQuery::recent(run_id.clone(), 1).in_stage(stage_id.clone()).of_type(event_type);
        Ok(!self.store.list_events(&query)?.is_empty())
    }

    /// Loads a run or reports it missing.
    fn require_run(&self, run_id: &RunId) -> Result<RolloutRun, ExecutorError> {
        self.store.load_run(run_id)?.ok_or_else(|| ExecutorError::RunNotFound(run_id.clone()))
    }

    /// Conditionally moves a run between statuses.
    async fn transition_run(
        &self,
        run_id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<bool, ExecutorError> {
        let at = self.clock.now();
        Ok(retry_on_conflict(|| self.store.transition_run(run_id, from, to, at)).await?)
    }

    /// Appends an event, absorbing store contention.
    async fn emit(&self, event: NewEvent) -> Result<RolloutEvent, ExecutorError> {
        Ok(retry_on_conflict(|| self.recorder.append(event.clone())).await?)
    }
}

/// Logs a finished worker task.
fn observe_worker(
    stage_id: &StageId,
    joined: Result<Result<TargetOutcome, WorkerError>, JoinError>,
) {
    match joined {
        Ok(Ok(outcome)) => {
            debug!(stage_id = %stage_id, target_id = %outcome.target_id, state = %outcome.state, "target resolved");
        }
        Ok(Err(err)) => {
            warn!(stage_id = %stage_id, error = %err, "target worker stopped without a terminal write");
        }
        Err(err) => {
            warn!(stage_id = %stage_id, error = %err, "target worker task failed");
        }
    }
}
