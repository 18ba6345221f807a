// crates/policy-rollout-core/tests/executor.rs
// ============================================================================
// Module: Rollout Executor Tests
// Description: End-to-end run lifecycles against the in-memory store.
// Purpose: Validate stage ordering, thresholds, operator controls, and recovery.
// Dependencies: policy-rollout-core, tokio
// ============================================================================

//! ## Overview
//! Drives full runs through [`RolloutExecutor`] with a scripted applier and
//! asserts on the stored targets, run status, and event log.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use common::Behavior;
use common::ScriptedApplier;
use common::events_of;
use common::eventually;
use common::executor;
use common::fast_config;
use common::memory_store;
use common::request;
use common::target;
use common::targets;
use common::within;
use policy_rollout_core::ApplyErrorKind;
use policy_rollout_core::Clock;
use policy_rollout_core::EventPayload;
use policy_rollout_core::EventSink;
use policy_rollout_core::EventType;
use policy_rollout_core::ExecutorError;
use policy_rollout_core::FailureThreshold;
use policy_rollout_core::ManualClock;
use policy_rollout_core::NewEvent;
use policy_rollout_core::RecordedReferenceSource;
use policy_rollout_core::ReferenceFreshnessGate;
use policy_rollout_core::RolloutEvent;
use policy_rollout_core::RolloutExecutor;
use policy_rollout_core::RunId;
use policy_rollout_core::RunStatus;
use policy_rollout_core::StageId;
use policy_rollout_core::StateStore;
use policy_rollout_core::SystemClock;
use policy_rollout_core::TargetState;
use policy_rollout_core::Timestamp;
use tokio::sync::Semaphore;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Two-stage fleet used by most scenarios.
const FLEET: &[&[&str]] = &[&["edge-1", "edge-2", "edge-3"], &["core-1", "core-2"]];

/// Creates, starts, and waits for a run.
async fn run_to_end(executor: &RolloutExecutor, run_id: &str) -> RunStatus {
    let run_id = RunId::new(run_id);
    executor.start(&run_id, "alice").await.unwrap();
    within(executor.wait(&run_id)).await.unwrap()
}

/// Sink that parks the recording task on the first event of one type.
struct ParkingSink {
    /// Event type to park on.
    park_on: EventType,
    /// Signals that the task is parked.
    parked: Mutex<Option<mpsc::Sender<()>>>,
    /// Releases the parked task.
    release: Mutex<mpsc::Receiver<()>>,
}

impl EventSink for ParkingSink {
    fn record(&self, event: &RolloutEvent) {
        if event.event_type() != self.park_on {
            return;
        }
        if let Some(parked) = self.parked.lock().unwrap().take() {
            parked.send(()).unwrap();
            self.release.lock().unwrap().recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }
}

/// Builds a parking sink with its parked and release channel ends.
fn parking_sink(park_on: EventType) -> (Arc<ParkingSink>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (parked_tx, parked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let sink = Arc::new(ParkingSink {
        park_on,
        parked: Mutex::new(Some(parked_tx)),
        release: Mutex::new(release_rx),
    });
    (sink, parked_rx, release_tx)
}

// ============================================================================
// SECTION: Stage Progression
// ============================================================================

#[tokio::test]
async fn all_targets_succeed_and_run_completes() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-a", FLEET)).unwrap();

    assert_eq!(run_to_end(&executor, "run-a").await, RunStatus::Completed);

    for sequencing in [1, 2] {
        for target in targets(&store, "run-a", sequencing) {
            assert_eq!(target.state, TargetState::Completed);
            assert_eq!(target.policy_hash.as_ref(), Some(&target.planned_hash));
            assert_eq!(target.attempt_count, 1);
        }
    }
    let completed = events_of(&store, "run-a", EventType::StageCompleted);
    assert_eq!(completed.len(), 2);
    let first_s2_apply = events_of(&store, "run-a", EventType::ApplyStarted)
        .into_iter()
        .find(|event| event.stage_id == Some(StageId::for_stage(&RunId::new("run-a"), 2)))
        .unwrap();
    assert!(completed[0].event_id < first_s2_apply.event_id, "stage 2 began before stage 1 resolved");
    assert_eq!(applier.calls().len(), 5);
}

#[tokio::test]
async fn permanent_failure_halts_run_and_leaves_later_stages_pending() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-2", Behavior::Permanent);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-b", FLEET)).unwrap();

    assert_eq!(run_to_end(&executor, "run-b").await, RunStatus::Failed);

    let failed = target(&store, "run-b", 1, "edge-2");
    assert_eq!(failed.state, TargetState::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.last_error.unwrap().contains("authentication rejected"));
    for target in targets(&store, "run-b", 2) {
        assert_eq!(target.state, TargetState::Pending);
    }
    assert_eq!(applier.call_count("core-1"), 0);
    let stage_failed = events_of(&store, "run-b", EventType::StageFailed);
    assert_eq!(stage_failed.len(), 1);
    let EventPayload::StageFailed {
        outcome,
    } = &stage_failed[0].payload
    else {
        panic!("unexpected payload");
    };
    assert_eq!((outcome.total, outcome.failed, outcome.completed), (3, 1, 2));
    assert!(events_of(&store, "run-b", EventType::StageStarted).len() == 1);
}

#[tokio::test]
async fn hash_mismatch_fails_target() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::WrongHash);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-d", &[&["edge-1"]])).unwrap();

    assert_eq!(run_to_end(&executor, "run-d").await, RunStatus::Failed);

    let mismatched = target(&store, "run-d", 1, "edge-1");
    assert_eq!(mismatched.state, TargetState::Failed);
    assert!(mismatched.policy_hash.is_none());
    assert!(mismatched.last_error.unwrap().contains("policy hash mismatch"));
    assert_eq!(applier.call_count("edge-1"), 1, "hash mismatch must not be retried");
}

#[tokio::test]
async fn lenient_threshold_tolerates_failures() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-3", Behavior::Permanent);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    let mut lenient = request("run-lenient", FLEET);
    lenient.failure_threshold = FailureThreshold::new(0.5);
    executor.create_run(&lenient).unwrap();

    assert_eq!(run_to_end(&executor, "run-lenient").await, RunStatus::Completed);
    assert_eq!(target(&store, "run-lenient", 1, "edge-3").state, TargetState::Failed);
    for target in targets(&store, "run-lenient", 2) {
        assert_eq!(target.state, TargetState::Completed);
    }
}

#[tokio::test]
async fn stage_threshold_overrides_run_threshold() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::Permanent);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    let mut canary = request("run-stage-threshold", FLEET);
    canary.stages[0].failure_threshold = FailureThreshold::new(0.34);
    executor.create_run(&canary).unwrap();

    assert_eq!(run_to_end(&executor, "run-stage-threshold").await, RunStatus::Completed);
}

// ============================================================================
// SECTION: Retries and Deadlines
// ============================================================================

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::TransientTimes(2));
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-retry", &[&["edge-1"]])).unwrap();

    assert_eq!(run_to_end(&executor, "run-retry").await, RunStatus::Completed);

    let retried = target(&store, "run-retry", 1, "edge-1");
    assert_eq!(retried.state, TargetState::Completed);
    assert_eq!(retried.attempt_count, 3);
    assert_eq!(retried.last_error.as_deref(), Some("transient apply error: connection reset"));
    let failures = events_of(&store, "run-retry", EventType::ApplyFailed);
    assert_eq!(failures.len(), 2);
    for event in failures {
        let EventPayload::ApplyFailed {
            error_kind,
            will_retry,
            ..
        } = event.payload
        else {
            panic!("unexpected payload");
        };
        assert_eq!(error_kind, ApplyErrorKind::Transient);
        assert!(will_retry);
    }
}

#[tokio::test]
async fn exhausted_retries_fail_target() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::AlwaysTransient);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-exhausted", &[&["edge-1"]])).unwrap();

    assert_eq!(run_to_end(&executor, "run-exhausted").await, RunStatus::Failed);

    let exhausted = target(&store, "run-exhausted", 1, "edge-1");
    assert_eq!(exhausted.state, TargetState::Failed);
    assert_eq!(exhausted.attempt_count, 3);
    assert_eq!(applier.call_count("edge-1"), 3);
    let last = events_of(&store, "run-exhausted", EventType::ApplyFailed).pop().unwrap();
    let EventPayload::ApplyFailed {
        attempt,
        will_retry,
        ..
    } = last.payload
    else {
        panic!("unexpected payload");
    };
    assert_eq!(attempt, 3);
    assert!(!will_retry);
}

#[tokio::test]
async fn apply_deadline_counts_as_transient_failure() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::Sleep(Duration::from_secs(10)));
    let mut config = fast_config();
    config.worker.apply_timeout = Duration::from_millis(20);
    config.worker.retry.max_attempts = 2;
    let executor = executor(&store, Arc::clone(&applier), config);
    executor.create_run(&request("run-deadline", &[&["edge-1"]])).unwrap();

    assert_eq!(run_to_end(&executor, "run-deadline").await, RunStatus::Failed);

    let timed_out = target(&store, "run-deadline", 1, "edge-1");
    assert_eq!(timed_out.attempt_count, 2);
    assert!(timed_out.last_error.unwrap().contains("deadline"));
}

// ============================================================================
// SECTION: Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_workers_never_exceed_concurrency_bound() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let hosts: Vec<String> = (0 .. 12).map(|index| format!("edge-{index}")).collect();
    for host in &hosts {
        applier.set(host, Behavior::Sleep(Duration::from_millis(5)));
    }
    let mut config = fast_config();
    config.max_concurrency = 3;
    let executor = executor(&store, Arc::clone(&applier), config);
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    executor.create_run(&request("run-bounded", &[&host_refs])).unwrap();

    assert_eq!(run_to_end(&executor, "run-bounded").await, RunStatus::Completed);
    assert!(applier.max_in_flight() <= 3, "observed {}", applier.max_in_flight());
    assert!(applier.max_in_flight() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_runs_do_not_interfere() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("lab-2", Behavior::Permanent);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-prod", &[&["prod-1", "prod-2"]])).unwrap();
    executor.create_run(&request("run-lab", &[&["lab-1", "lab-2"]])).unwrap();

    executor.start(&RunId::new("run-prod"), "alice").await.unwrap();
    executor.start(&RunId::new("run-lab"), "bob").await.unwrap();

    assert_eq!(within(executor.wait(&RunId::new("run-prod"))).await.unwrap(), RunStatus::Completed);
    assert_eq!(within(executor.wait(&RunId::new("run-lab"))).await.unwrap(), RunStatus::Failed);
    eventually(|| executor.active_runs().is_empty()).await;
}

#[tokio::test]
async fn dry_run_flag_reaches_applier() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    let mut dry = request("run-dry", &[&["edge-1", "edge-2"]]);
    dry.dry_run = true;
    executor.create_run(&dry).unwrap();

    assert_eq!(run_to_end(&executor, "run-dry").await, RunStatus::Completed);
    assert!(applier.calls().iter().all(|call| call.dry_run));
    let started = events_of(&store, "run-dry", EventType::RunStarted);
    assert!(matches!(
        started[0].payload,
        EventPayload::RunStarted {
            dry_run: true,
            ..
        }
    ));
}

// ============================================================================
// SECTION: Operator Controls
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_skips_pending_and_lets_in_flight_finish() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let gate = Arc::new(Semaphore::new(0));
    for host in ["edge-1", "edge-2", "edge-3"] {
        applier.set(host, Behavior::Hold(Arc::clone(&gate)));
    }
    let mut config = fast_config();
    config.max_concurrency = 2;
    let executor = executor(&store, Arc::clone(&applier), config);
    executor.create_run(&request("run-c", FLEET)).unwrap();
    let run_id = RunId::new("run-c");
    executor.start(&run_id, "alice").await.unwrap();
    eventually(|| applier.calls().len() == 2).await;

    executor.abort(&run_id, "bob").await.unwrap();

    let stage_one = targets(&store, "run-c", 1);
    let in_progress = stage_one.iter().filter(|target| target.state == TargetState::InProgress);
    assert_eq!(in_progress.count(), 2);
    let skipped: Vec<_> =
        stage_one.iter().filter(|target| target.state == TargetState::Skipped).collect();
    assert_eq!(skipped.len(), 1);
    for target in targets(&store, "run-c", 2) {
        assert_eq!(target.state, TargetState::Skipped);
    }

    gate.add_permits(2);
    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Aborted);
    let finished = targets(&store, "run-c", 1);
    assert_eq!(finished.iter().filter(|target| target.state == TargetState::Completed).count(), 2);
    assert_eq!(applier.calls().len(), 2);

    let aborted = events_of(&store, "run-c", EventType::RunAborted);
    assert_eq!(aborted.len(), 1);
    assert!(matches!(
        &aborted[0].payload,
        EventPayload::RunAborted {
            requested_by,
            skipped_targets: 3,
        } if requested_by == "bob"
    ));

    let repeat = executor.abort(&run_id, "bob").await.unwrap();
    assert_eq!(repeat.status, RunStatus::Aborted);
    assert_eq!(events_of(&store, "run-c", EventType::RunAborted).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_cancels_cooperative_appliers() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::UntilCancelled);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    executor.create_run(&request("run-cancel", &[&["edge-1"]])).unwrap();
    let run_id = RunId::new("run-cancel");
    executor.start(&run_id, "alice").await.unwrap();
    eventually(|| applier.calls().len() == 1).await;

    executor.abort(&run_id, "alice").await.unwrap();

    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Aborted);
    let cancelled = target(&store, "run-cancel", 1, "edge-1");
    assert_eq!(cancelled.state, TargetState::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("apply cancelled"));
}

#[tokio::test]
async fn abort_before_start_skips_every_target() {
    let store = memory_store();
    let executor = executor(&store, ScriptedApplier::new(), fast_config());
    executor.create_run(&request("run-planned", FLEET)).unwrap();
    let run_id = RunId::new("run-planned");

    let aborted = executor.abort(&run_id, "alice").await.unwrap();

    assert_eq!(aborted.status, RunStatus::Aborted);
    for sequencing in [1, 2] {
        assert!(
            targets(&store, "run-planned", sequencing)
                .iter()
                .all(|target| target.state == TargetState::Skipped)
        );
    }
    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Aborted);
    let err = executor.start(&run_id, "alice").await.unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::InvalidTransition {
            status: RunStatus::Aborted,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_wins_over_stage_failure_not_yet_finalized() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::Permanent);
    let (sink, parked, release) = parking_sink(EventType::StageFailed);
    let executor = RolloutExecutor::builder(store.clone(), Arc::clone(&applier) as _)
        .event_sink(sink)
        .config(fast_config())
        .build()
        .unwrap();
    let fleet: &[&[&str]] = &[&["edge-1"], &["edge-2", "edge-3"]];
    executor.create_run(&request("run-race", fleet)).unwrap();
    let run_id = RunId::new("run-race");
    executor.start(&run_id, "alice").await.unwrap();
    tokio::task::spawn_blocking(move || parked.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    let aborted = executor.abort(&run_id, "bob").await.unwrap();
    release.send(()).unwrap();

    assert_eq!(aborted.status, RunStatus::Aborted);
    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Aborted);
    assert_eq!(store.load_run(&run_id).unwrap().unwrap().status, RunStatus::Aborted);
    assert!(targets(&store, "run-race", 2).iter().all(|target| target.state == TargetState::Skipped));
    assert_eq!(events_of(&store, "run-race", EventType::RunAborted).len(), 1);
    assert_eq!(applier.calls().len(), 1);
}

#[tokio::test]
async fn abort_after_stage_failure_leaves_later_stages_pending() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    applier.set("edge-1", Behavior::Permanent);
    let executor = executor(&store, Arc::clone(&applier), fast_config());
    let fleet: &[&[&str]] = &[&["edge-1"], &["edge-2", "edge-3"]];
    executor.create_run(&request("run-failed", fleet)).unwrap();
    assert_eq!(run_to_end(&executor, "run-failed").await, RunStatus::Failed);

    let err = executor.abort(&RunId::new("run-failed"), "bob").await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::InvalidTransition {
            status: RunStatus::Failed,
            ..
        }
    ));
    assert!(targets(&store, "run-failed", 2).iter().all(|target| target.state == TargetState::Pending));
    assert!(events_of(&store, "run-failed", EventType::RunAborted).is_empty());
}

#[tokio::test]
async fn controls_reject_finished_runs() {
    let store = memory_store();
    let executor = executor(&store, ScriptedApplier::new(), fast_config());
    executor.create_run(&request("run-done", &[&["edge-1"]])).unwrap();
    assert_eq!(run_to_end(&executor, "run-done").await, RunStatus::Completed);
    let run_id = RunId::new("run-done");

    for result in [
        executor.abort(&run_id, "alice").await,
        executor.pause(&run_id, "alice").await,
        executor.resume(&run_id, "alice").await,
        executor.start(&run_id, "alice").await,
    ] {
        assert!(matches!(
            result,
            Err(ExecutorError::InvalidTransition {
                status: RunStatus::Completed,
                ..
            })
        ));
    }
    let missing = executor.start(&RunId::new("run-missing"), "alice").await.unwrap_err();
    assert!(matches!(missing, ExecutorError::RunNotFound(_)));
}

#[tokio::test]
async fn pause_rejects_planning_run() {
    let store = memory_store();
    let executor = executor(&store, ScriptedApplier::new(), fast_config());
    executor.create_run(&request("run-idle", &[&["edge-1"]])).unwrap();

    let err = executor.pause(&RunId::new("run-idle"), "alice").await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::InvalidTransition {
            status: RunStatus::Planning,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_drains_in_flight_and_resume_continues() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let gate = Arc::new(Semaphore::new(0));
    for host in ["edge-1", "edge-2", "edge-3"] {
        applier.set(host, Behavior::Hold(Arc::clone(&gate)));
    }
    let mut config = fast_config();
    config.max_concurrency = 2;
    let executor = executor(&store, Arc::clone(&applier), config);
    executor.create_run(&request("run-pause", FLEET)).unwrap();
    let run_id = RunId::new("run-pause");
    executor.start(&run_id, "alice").await.unwrap();
    eventually(|| applier.calls().len() == 2).await;

    assert_eq!(executor.pause(&run_id, "alice").await.unwrap().status, RunStatus::Paused);
    assert_eq!(executor.pause(&run_id, "alice").await.unwrap().status, RunStatus::Paused);
    gate.add_permits(2);
    eventually(|| {
        targets(&store, "run-pause", 1)
            .iter()
            .filter(|target| target.state == TargetState::Completed)
            .count()
            == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(applier.calls().len(), 2, "paused run dispatched new work");
    assert_eq!(target(&store, "run-pause", 1, "edge-3").state, TargetState::Pending);

    gate.add_permits(1);
    assert_eq!(executor.resume(&run_id, "bob").await.unwrap().status, RunStatus::Active);
    assert_eq!(executor.resume(&run_id, "bob").await.unwrap().status, RunStatus::Active);
    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Completed);

    assert_eq!(events_of(&store, "run-pause", EventType::RunPaused).len(), 1);
    assert_eq!(events_of(&store, "run-pause", EventType::RunResumed).len(), 1);
    assert_eq!(applier.calls().len(), 5);
}

// ============================================================================
// SECTION: Safety Gates
// ============================================================================

#[tokio::test]
async fn blocked_gate_holds_stage_until_override() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let source = Arc::new(RecordedReferenceSource::new());
    let gate = ReferenceFreshnessGate::new(source, Duration::from_secs(3600));
    let executor = RolloutExecutor::builder(store.clone(), Arc::clone(&applier) as _)
        .safety_gate(Arc::new(gate))
        .config(fast_config())
        .build()
        .unwrap();
    executor.create_run(&request("run-gated", &[&["edge-1"]])).unwrap();
    let run_id = RunId::new("run-gated");
    executor.start(&run_id, "alice").await.unwrap();

    eventually(|| !events_of(&store, "run-gated", EventType::SafetyGateBlocked).is_empty()).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    let blocked = events_of(&store, "run-gated", EventType::SafetyGateBlocked);
    assert_eq!(blocked.len(), 1, "unchanged reason must be recorded once");
    assert!(matches!(
        &blocked[0].payload,
        EventPayload::SafetyGateBlocked { reason } if reason.contains("never been refreshed")
    ));
    assert!(applier.calls().is_empty());

    let stage_id = StageId::for_stage(&run_id, 1);
    executor
        .override_gate(&run_id, &stage_id, "carol", "reference feed down, verified manually")
        .await
        .unwrap();

    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Completed);
    assert_eq!(events_of(&store, "run-gated", EventType::SafetyGateOverridden).len(), 1);
    let missing = executor
        .override_gate(&run_id, &StageId::new("run-gated/stage-9"), "carol", "x")
        .await
        .unwrap_err();
    assert!(matches!(missing, ExecutorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn stale_reference_data_is_recorded_once_while_it_ages() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let clock = Arc::new(ManualClock::starting_at(Timestamp::from_unix_millis(10_000)));
    let source = Arc::new(RecordedReferenceSource::new());
    source.record_refresh(Timestamp::from_unix_millis(0));
    let gate = ReferenceFreshnessGate::new(source, Duration::from_secs(1));
    let executor = RolloutExecutor::builder(store.clone(), Arc::clone(&applier) as _)
        .safety_gate(Arc::new(gate))
        .clock(Arc::clone(&clock) as _)
        .config(fast_config())
        .build()
        .unwrap();
    executor.create_run(&request("run-stale", &[&["edge-1"]])).unwrap();
    let run_id = RunId::new("run-stale");
    executor.start(&run_id, "alice").await.unwrap();
    eventually(|| !events_of(&store, "run-stale", EventType::SafetyGateBlocked).is_empty()).await;

    for _ in 0 .. 5 {
        clock.advance(1_000);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let blocked = events_of(&store, "run-stale", EventType::SafetyGateBlocked);
    assert_eq!(blocked.len(), 1, "an aging block must be recorded once");
    assert!(matches!(
        &blocked[0].payload,
        EventPayload::SafetyGateBlocked { reason } if reason.contains("older than 1s")
    ));
    assert!(applier.calls().is_empty());
    executor
        .override_gate(&run_id, &StageId::for_stage(&run_id, 1), "carol", "feed verified")
        .await
        .unwrap();
    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn gate_clears_once_reference_data_refreshes() {
    let store = memory_store();
    let applier = ScriptedApplier::new();
    let source = Arc::new(RecordedReferenceSource::new());
    let gate = ReferenceFreshnessGate::new(Arc::clone(&source) as _, Duration::from_secs(3600));
    let executor = RolloutExecutor::builder(store.clone(), Arc::clone(&applier) as _)
        .safety_gate(Arc::new(gate))
        .config(fast_config())
        .build()
        .unwrap();
    executor.create_run(&request("run-refresh", &[&["edge-1"]])).unwrap();
    let run_id = RunId::new("run-refresh");
    executor.start(&run_id, "alice").await.unwrap();
    eventually(|| !events_of(&store, "run-refresh", EventType::SafetyGateBlocked).is_empty()).await;

    source.record_refresh(SystemClock.now());

    assert_eq!(within(executor.wait(&run_id)).await.unwrap(), RunStatus::Completed);
    assert!(events_of(&store, "run-refresh", EventType::SafetyGateOverridden).is_empty());
}

#[tokio::test]
async fn override_rejects_unknown_stage() {
    let store = memory_store();
    let executor = executor(&store, ScriptedApplier::new(), fast_config());
    executor.create_run(&request("run-override", &[&["edge-1"]])).unwrap();
    let run_id = RunId::new("run-override");

    let err = executor
        .override_gate(&run_id, &StageId::new("run-override/stage-7"), "carol", "x")
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::StageNotFound { .. }));
}

// ============================================================================
// SECTION: Recovery
// ============================================================================

#[tokio::test]
async fn recover_fails_interrupted_targets_and_resumes_run() {
    let store = memory_store();
    let first = executor(&store, ScriptedApplier::new(), fast_config());
    first.create_run(&request("run-crash", FLEET)).unwrap();
    let run_id = RunId::new("run-crash");
    let at = Timestamp::from_unix_millis(1);
    assert!(store.transition_run(&run_id, &[RunStatus::Planning], RunStatus::Active, at).unwrap());
    let interrupted = target(&store, "run-crash", 1, "edge-1");
    assert!(
        store
            .try_transition(&interrupted.target_id, TargetState::Pending, TargetState::InProgress, at)
            .unwrap()
    );

    let applier = ScriptedApplier::new();
    let restarted = executor(&store, Arc::clone(&applier), fast_config());
    let report = restarted.recover().await.unwrap();

    assert_eq!(report.resumed, vec![run_id.clone()]);
    assert_eq!(report.interrupted_targets, 1);
    assert_eq!(within(restarted.wait(&run_id)).await.unwrap(), RunStatus::Failed);
    let failed = target(&store, "run-crash", 1, "edge-1");
    assert_eq!(failed.state, TargetState::Failed);
    assert_eq!(applier.call_count("edge-1"), 0);
    assert_eq!(target(&store, "run-crash", 1, "edge-2").state, TargetState::Completed);
    assert_eq!(target(&store, "run-crash", 2, "core-1").state, TargetState::Pending);
}

#[tokio::test]
async fn recover_finalizes_unfinished_abort() {
    let store = memory_store();
    let first = executor(&store, ScriptedApplier::new(), fast_config());
    first.create_run(&request("run-half-aborted", FLEET)).unwrap();
    let run_id = RunId::new("run-half-aborted");
    let at = Timestamp::from_unix_millis(1);
    assert!(store.transition_run(&run_id, &[RunStatus::Planning], RunStatus::Active, at).unwrap());
    store
        .append_event(NewEvent::for_run(run_id.clone(), at, EventPayload::RunAborted {
            requested_by: "alice".to_string(),
            skipped_targets: 0,
        }))
        .unwrap();

    let applier = ScriptedApplier::new();
    let restarted = executor(&store, Arc::clone(&applier), fast_config());
    let report = restarted.recover().await.unwrap();

    assert_eq!(report.aborted, vec![run_id.clone()]);
    assert!(report.resumed.is_empty());
    assert_eq!(store.load_run(&run_id).unwrap().unwrap().status, RunStatus::Aborted);
    assert!(
        targets(&store, "run-half-aborted", 1)
            .iter()
            .all(|target| target.state == TargetState::Skipped)
    );
    assert!(applier.calls().is_empty());
}

#[tokio::test]
async fn recover_completes_abort_cut_short_after_status_write() {
    let store = memory_store();
    let first = executor(&store, ScriptedApplier::new(), fast_config());
    first.create_run(&request("run-cut-short", FLEET)).unwrap();
    let run_id = RunId::new("run-cut-short");
    let at = Timestamp::from_unix_millis(1);
    assert!(store.transition_run(&run_id, &[RunStatus::Planning], RunStatus::Active, at).unwrap());
    let interrupted = target(&store, "run-cut-short", 1, "edge-1");
    assert!(
        store
            .try_transition(&interrupted.target_id, TargetState::Pending, TargetState::InProgress, at)
            .unwrap()
    );
    assert!(store.transition_run(&run_id, &[RunStatus::Active], RunStatus::Aborted, at).unwrap());

    let applier = ScriptedApplier::new();
    let restarted = executor(&store, Arc::clone(&applier), fast_config());
    let report = restarted.recover().await.unwrap();

    assert_eq!(report.aborted, vec![run_id.clone()]);
    assert_eq!(report.interrupted_targets, 1);
    assert_eq!(target(&store, "run-cut-short", 1, "edge-1").state, TargetState::Failed);
    for sequencing in [1, 2] {
        assert!(
            targets(&store, "run-cut-short", sequencing)
                .iter()
                .all(|target| target.state.is_terminal())
        );
    }
    let aborted = events_of(&store, "run-cut-short", EventType::RunAborted);
    assert_eq!(aborted.len(), 1);
    assert!(matches!(
        &aborted[0].payload,
        EventPayload::RunAborted { skipped_targets: 4, .. }
    ));
    assert!(applier.calls().is_empty());

    let again = restarted.recover().await.unwrap();
    assert!(again.aborted.is_empty());
}

#[tokio::test]
async fn wait_reports_runs_without_control_task() {
    let store = memory_store();
    let executor = executor(&store, ScriptedApplier::new(), fast_config());
    executor.create_run(&request("run-idle", &[&["edge-1"]])).unwrap();

    let err = executor.wait(&RunId::new("run-idle")).await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::NotRunning {
            status: RunStatus::Planning,
            ..
        }
    ));
}
