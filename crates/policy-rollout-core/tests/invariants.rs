// crates/policy-rollout-core/tests/invariants.rs
// ============================================================================
// Module: Target Lifecycle Property Tests
// Description: Property checks for conditional target transitions.
// Purpose: Ensure claims are exclusive and terminal states are never left.
// Dependencies: policy-rollout-core, proptest
// ============================================================================

//! ## Overview
//! Drives random mutation sequences and concurrent claims against the
//! in-memory store and checks the lifecycle invariants after every step.

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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use common::request;
use policy_rollout_core::DEFAULT_HASH_ALGORITHM;
use policy_rollout_core::FailureThreshold;
use policy_rollout_core::InMemoryStateStore;
use policy_rollout_core::ManualClock;
use policy_rollout_core::RolloutPlanner;
use policy_rollout_core::SharedStateStore;
use policy_rollout_core::StageStats;
use policy_rollout_core::StateStore;
use policy_rollout_core::TargetId;
use policy_rollout_core::TargetMutation;
use policy_rollout_core::TargetState;
use policy_rollout_core::Timestamp;
use policy_rollout_core::hash_bytes;
use proptest::prelude::*;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Hostnames of the single-stage fleet.
const HOSTS: [&str; 4] = ["edge-1", "edge-2", "edge-3", "edge-4"];

/// Store seeded with one run over [`HOSTS`]; returns its target ids.
fn seeded() -> (InMemoryStateStore, Vec<TargetId>) {
    let store = InMemoryStateStore::new();
    let planner = RolloutPlanner::new(
        SharedStateStore::from_store(store.clone()),
        Arc::new(ManualClock::starting_at(Timestamp::from_unix_millis(0))),
        FailureThreshold::STRICT,
    );
    let hosts: &[&str] = &HOSTS;
    let plan = planner.plan(&request("run-prop", &[hosts])).unwrap();
    store.create_run(&plan).unwrap();
    let ids = plan.stages[0].targets.iter().map(|planned| planned.target.target_id.clone()).collect();
    (store, ids)
}

/// Mutation kinds the property drives.
#[derive(Debug, Clone, Copy)]
enum Op {
    /// Pending to in-progress.
    Claim,
    /// Attempt bump.
    Attempt,
    /// Completion with a hash.
    Complete,
    /// Failure.
    Fail,
    /// Skip from pending.
    SkipPending,
    /// Skip from in-progress.
    SkipOwned,
    /// Run-wide skip.
    SkipAll,
}

/// Strategy over [`Op`].
fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Claim),
        Just(Op::Attempt),
        Just(Op::Complete),
        Just(Op::Fail),
        Just(Op::SkipPending),
        Just(Op::SkipOwned),
        Just(Op::SkipAll),
    ]
}

/// Builds the mutation for `op` on `target_id`.
fn mutation(op: Op, target_id: TargetId, at: Timestamp) -> TargetMutation {
    match op {
        Op::Claim => TargetMutation::claim(target_id, at),
        Op::Attempt => TargetMutation::begin_attempt(target_id, at),
        Op::Complete => {
            TargetMutation::complete(target_id, hash_bytes(DEFAULT_HASH_ALGORITHM, b"applied"), at)
        }
        Op::Fail => TargetMutation::fail(target_id, "permanent apply error", at),
        Op::SkipPending => {
            TargetMutation::transition(target_id, TargetState::Pending, TargetState::Skipped, at)
        }
        Op::SkipOwned | Op::SkipAll => {
            TargetMutation::transition(target_id, TargetState::InProgress, TargetState::Skipped, at)
        }
    }
}

// ============================================================================
// SECTION: Properties
// ============================================================================

proptest! {
    #[test]
    fn lifecycle_invariants_hold_under_random_mutations(
        steps in prop::collection::vec((0usize .. HOSTS.len(), op()), 1 .. 64)
    ) {
        let (store, ids) = seeded();
        let first = store.load_target(&ids[0]).unwrap().unwrap();
        let (run_id, stage_id) = (first.run_id, first.stage_id);
        let mut previous: BTreeMap<TargetId, TargetState> =
            ids.iter().map(|id| (id.clone(), TargetState::Pending)).collect();

        for (index, (target, op)) in steps.into_iter().enumerate() {
            let at = Timestamp::from_unix_millis(i64::try_from(index).unwrap());
            if matches!(op, Op::SkipAll) {
                store.skip_pending_targets(&run_id, at).unwrap();
            } else {
                let before = previous[&ids[target]];
                let applied = store.update_target(&mutation(op, ids[target].clone(), at)).unwrap();
                if before.is_terminal() {
                    prop_assert!(!applied, "terminal target {before} changed");
                }
            }

            let targets = store.list_targets(&stage_id).unwrap();
            let stats = StageStats::from_targets(&targets);
            prop_assert_eq!(
                stats.total,
                stats.pending + stats.in_progress + stats.completed + stats.failed + stats.skipped
            );
            prop_assert_eq!(stats.total, u64::try_from(HOSTS.len()).unwrap());
            for target in &targets {
                let before = previous[&target.target_id];
                prop_assert!(
                    before == target.state || before.can_transition_to(target.state),
                    "illegal move {} -> {}", before, target.state
                );
                prop_assert_eq!(target.policy_hash.is_some(), target.state == TargetState::Completed);
                previous.insert(target.target_id.clone(), target.state);
            }
        }
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner(contenders in 2usize .. 12) {
        let (store, ids) = seeded();
        let winners = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0 .. contenders {
                scope.spawn(|| {
                    let won = store
                        .try_transition(
                            &ids[0],
                            TargetState::Pending,
                            TargetState::InProgress,
                            Timestamp::from_unix_millis(1),
                        )
                        .unwrap();
                    if won {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        prop_assert_eq!(winners.load(Ordering::SeqCst), 1);
        prop_assert_eq!(store.load_target(&ids[0]).unwrap().unwrap().state, TargetState::InProgress);
    }
}
