// crates/policy-rollout-core/src/runtime/store.rs
// ============================================================================
// Module: Policy Rollout In-Memory Store
// Description: Snapshot-isolated in-memory state store and shared wrapper.
// Purpose: Provide a deterministic store for tests and local demos.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemoryStateStore`] keeps every table behind one `RwLock<Arc<_>>`.
//! Readers clone the `Arc` under a brief read lock and then work on an
//! immutable snapshot, so aggregates are point-in-time consistent and never
//! hold a lock while computing. Writers take the write lock and mutate via
//! `Arc::make_mut`, copying the tables only while a reader still holds the
//! previous snapshot. It is not intended for production use.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::core::EventId;
use crate::core::EventQuery;
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
use crate::core::StageStats;
use crate::core::StageWithStats;
use crate::core::TargetId;
use crate::core::TargetMutation;
use crate::core::TargetState;
use crate::core::Timestamp;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Tables
// ============================================================================

/// Run row with its insertion sequence for stable ordering.
#[derive(Debug, Clone)]
struct RunRow {
    /// Run record.
    run: RolloutRun,
    /// Insertion sequence.
    seq: u64,
}

/// Target row with its planned artifact.
#[derive(Debug, Clone)]
struct TargetRow {
    /// Target record.
    target: RolloutTarget,
    /// Planned artifact.
    artifact: PolicyArtifact,
}

/// Complete store contents; one value is one consistent snapshot.
#[derive(Debug, Clone, Default)]
struct Tables {
    /// Runs keyed by identifier.
    runs: BTreeMap<RunId, RunRow>,
    /// Stages per run in ascending sequencing.
    stages: BTreeMap<RunId, Vec<RolloutStage>>,
    /// Target identifiers per stage in creation order.
    stage_targets: BTreeMap<StageId, Vec<TargetId>>,
    /// Target rows keyed by identifier.
    targets: BTreeMap<TargetId, TargetRow>,
    /// Events per run in append order.
    events: BTreeMap<RunId, Vec<RolloutEvent>>,
    /// Last assigned event identifier.
    last_event_id: u64,
    /// Last assigned run sequence.
    last_run_seq: u64,
}

impl Tables {
    /// Returns a stage's targets in creation order.
    fn stage_targets(&self, stage_id: &StageId) -> impl Iterator<Item = &RolloutTarget> {
        self.stage_targets
            .get(stage_id)
            .into_iter()
            .flatten()
            .filter_map(|target_id| self.targets.get(target_id).map(|row| &row.target))
    }
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// In-memory state store for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    /// Current snapshot protected by a reader/writer lock.
    tables: Arc<RwLock<Arc<Tables>>>,
}

impl InMemoryStateStore {
    /// Creates an empty in-memory state store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    fn snapshot(&self) -> Result<Arc<Tables>, StoreError> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StoreError::Store("rollout state store lock poisoned".to_string()))?;
        Ok(Arc::clone(&guard))
    }

    /// Runs a mutation against the tables under the write lock.
    ///
    /// Closures must finish validating before they mutate anything.
    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StoreError::Store("rollout state store lock poisoned".to_string()))?;
        let value = mutate(Arc::make_mut(&mut *guard));
        drop(guard);
        value
    }
}

impl StateStore for InMemoryStateStore {
    fn create_run(&self, plan: &RunPlan) -> Result<(), StoreError> {
        self.write(|tables| {
            let run_id = &plan.run.run_id;
            if tables.runs.contains_key(run_id) {
                return Err(StoreError::Invalid(format!("run already exists: {run_id}")));
            }
            for planned in plan.stages.iter().flat_map(|stage| &stage.targets) {
                if tables.targets.contains_key(&planned.target.target_id) {
                    return Err(StoreError::Invalid(format!(
                        "target already exists: {}",
                        planned.target.target_id
                    )));
                }
            }
            tables.last_run_seq += 1;
            tables.runs.insert(
                run_id.clone(),
                RunRow {
                    run: plan.run.clone(),
                    seq: tables.last_run_seq,
                },
            );
            let mut stages: Vec<RolloutStage> =
                plan.stages.iter().map(|stage| stage.stage.clone()).collect();
            stages.sort_by_key(|stage| stage.sequencing);
            tables.stages.insert(run_id.clone(), stages);
            for planned_stage in &plan.stages {
                let ids = planned_stage
                    .targets
                    .iter()
                    .map(|planned| planned.target.target_id.clone())
                    .collect();
                tables.stage_targets.insert(planned_stage.stage.stage_id.clone(), ids);
                for planned in &planned_stage.targets {
                    tables.targets.insert(
                        planned.target.target_id.clone(),
                        TargetRow {
                            target: planned.target.clone(),
                            artifact: planned.artifact.clone(),
                        },
                    );
                }
            }
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<RolloutRun>, StoreError> {
        Ok(self.snapshot()?.runs.get(run_id).map(|row| row.run.clone()))
    }

    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RolloutRun>, StoreError> {
        let tables = self.snapshot()?;
        let mut rows: Vec<&RunRow> = tables
            .runs
            .values()
            .filter(|row| status.is_none_or(|wanted| row.run.status == wanted))
            .collect();
        rows.sort_by(|a, b| (b.run.created_at, b.seq).cmp(&(a.run.created_at, a.seq)));
        Ok(rows.into_iter().take(limit).map(|row| row.run.clone()).collect())
    }

    fn list_stages(&self, run_id: &RunId) -> Result<Vec<RolloutStage>, StoreError> {
        Ok(self.snapshot()?.stages.get(run_id).cloned().unwrap_or_default())
    }

    fn list_targets(&self, stage_id: &StageId) -> Result<Vec<RolloutTarget>, StoreError> {
        Ok(self.snapshot()?.stage_targets(stage_id).cloned().collect())
    }

    fn load_target(&self, target_id: &TargetId) -> Result<Option<RolloutTarget>, StoreError> {
        Ok(self.snapshot()?.targets.get(target_id).map(|row| row.target.clone()))
    }

    fn load_artifact(&self, target_id: &TargetId) -> Result<Option<PolicyArtifact>, StoreError> {
        Ok(self.snapshot()?.targets.get(target_id).map(|row| row.artifact.clone()))
    }

    fn update_target(&self, mutation: &TargetMutation) -> Result<bool, StoreError> {
        mutation.validate()?;
        self.write(|tables| {
            let row = tables
                .targets
                .get_mut(&mutation.target_id)
                .ok_or_else(|| StoreError::NotFound(mutation.target_id.to_string()))?;
            let target = &mut row.target;
            if target.state != mutation.expected {
                return Ok(false);
            }
            target.state = mutation.next;
            target.updated_at = mutation.at;
            if mutation.increment_attempts {
                target.attempt_count = target.attempt_count.saturating_add(1);
            }
            if let Some(error) = &mutation.last_error {
                target.last_error = Some(error.clone());
            }
            if let Some(hash) = &mutation.policy_hash {
                target.policy_hash = Some(hash.clone());
            }
            Ok(true)
        })
    }

    fn skip_pending_targets(&self, run_id: &RunId, at: Timestamp) -> Result<u64, StoreError> {
        self.write(|tables| {
            let status = tables
                .runs
                .get(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?
                .run
                .status;
            if matches!(status, RunStatus::Completed | RunStatus::Failed) {
                return Ok(0);
            }
            let stage_ids: Vec<StageId> = tables
                .stages
                .get(run_id)
                .into_iter()
                .flatten()
                .map(|stage| stage.stage_id.clone())
                .collect();
            let target_ids: Vec<TargetId> = stage_ids
                .iter()
                .filter_map(|stage_id| tables.stage_targets.get(stage_id))
                .flatten()
                .cloned()
                .collect();
            let mut skipped = 0;
            for target_id in target_ids {
                if let Some(row) = tables.targets.get_mut(&target_id)
                    && row.target.state == TargetState::Pending
                {
                    row.target.state = TargetState::Skipped;
                    row.target.updated_at = at;
                    skipped += 1;
                }
            }
            Ok(skipped)
        })
    }

    fn transition_run(
        &self,
        run_id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        validate_run_transition(from, to)?;
        self.write(|tables| {
            let row = tables
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
            if !from.contains(&row.run.status) {
                return Ok(false);
            }
            row.run.status = to;
            row.run.updated_at = at;
            Ok(true)
        })
    }

    fn append_event(&self, event: NewEvent) -> Result<RolloutEvent, StoreError> {
        self.write(|tables| {
            if !tables.runs.contains_key(&event.run_id) {
                return Err(StoreError::NotFound(event.run_id.to_string()));
            }
            let event_id = EventId::from_raw(tables.last_event_id + 1)
                .ok_or_else(|| StoreError::Store("event id overflow".to_string()))?;
            tables.last_event_id = event_id.get();
            let log = tables.events.entry(event.run_id.clone()).or_default();
            let timestamp = log
                .last()
                .map_or(event.timestamp, |last| event.timestamp.max(last.timestamp));
            let recorded = RolloutEvent::from_new(event_id, timestamp, event);
            log.push(recorded.clone());
            Ok(recorded)
        })
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<RolloutEvent>, StoreError> {
        let tables = self.snapshot()?;
        Ok(tables
            .events
            .get(&query.run_id)
            .into_iter()
            .flat_map(|log| log.iter().rev())
            .filter(|event| query.matches(event))
            .take(query.limit)
            .cloned()
            .collect())
    }

    fn run_stage_stats(&self, run_id: &RunId) -> Result<Vec<StageWithStats>, StoreError> {
        let tables = self.snapshot()?;
        Ok(tables
            .stages
            .get(run_id)
            .into_iter()
            .flatten()
            .map(|stage| StageWithStats {
                stage: stage.clone(),
                stats: StageStats::from_targets(tables.stage_targets(&stage.stage_id)),
            })
            .collect())
    }

    fn readiness(&self) -> Result<(), StoreError> {
        self.snapshot().map(|_| ())
    }
}

/// Rejects run transitions that break the lifecycle.
///
/// # Errors
///
/// Returns [`StoreError::Invalid`] when any `from -> to` pair is illegal.
pub fn validate_run_transition(from: &[RunStatus], to: RunStatus) -> Result<(), StoreError> {
    if from.is_empty() {
        return Err(StoreError::Invalid("run transition requires a source status".to_string()));
    }
    if let Some(bad) = from.iter().find(|status| !status.can_transition_to(to)) {
        return Err(StoreError::Invalid(format!("illegal run transition: {bad} -> {to}")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Shared state store backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedStateStore {
    /// Inner store implementation.
    inner: Arc<dyn StateStore + Send + Sync>,
}

impl SharedStateStore {
    /// Wraps a state store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl StateStore + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn StateStore + Send + Sync>) -> Self {
        Self {
            inner: store,
        }
    }
}

impl StateStore for SharedStateStore {
    fn create_run(&self, plan: &RunPlan) -> Result<(), StoreError> {
        self.inner.create_run(plan)
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<RolloutRun>, StoreError> {
        self.inner.load_run(run_id)
    }

    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RolloutRun>, StoreError> {
        self.inner.list_runs(status, limit)
    }

    fn list_stages(&self, run_id: &RunId) -> Result<Vec<RolloutStage>, StoreError> {
        self.inner.list_stages(run_id)
    }

    fn list_targets(&self, stage_id: &StageId) -> Result<Vec<RolloutTarget>, StoreError> {
        self.inner.list_targets(stage_id)
    }

    fn load_target(&self, target_id: &TargetId) -> Result<Option<RolloutTarget>, StoreError> {
        self.inner.load_target(target_id)
    }

    fn load_artifact(&self, target_id: &TargetId) -> Result<Option<PolicyArtifact>, StoreError> {
        self.inner.load_artifact(target_id)
    }

    fn update_target(&self, mutation: &TargetMutation) -> Result<bool, StoreError> {
        self.inner.update_target(mutation)
    }

    fn skip_pending_targets(&self, run_id: &RunId, at: Timestamp) -> Result<u64, StoreError> {
        self.inner.skip_pending_targets(run_id, at)
    }

    fn transition_run(
        &self,
        run_id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        self.inner.transition_run(run_id, from, to, at)
    }

    fn append_event(&self, event: NewEvent) -> Result<RolloutEvent, StoreError> {
        self.inner.append_event(event)
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<RolloutEvent>, StoreError> {
        self.inner.list_events(query)
    }

    fn run_stage_stats(&self, run_id: &RunId) -> Result<Vec<StageWithStats>, StoreError> {
        self.inner.run_stage_stats(run_id)
    }

    fn readiness(&self) -> Result<(), StoreError> {
        self.inner.readiness()
    }
}
