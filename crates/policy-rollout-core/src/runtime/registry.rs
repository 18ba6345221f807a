// crates/policy-rollout-core/src/runtime/registry.rs
// ============================================================================
// Module: Policy Rollout Run Registry
// Description: Per-run control task handles keyed by run identifier.
// Purpose: Route operator signals to the task that owns each active run.
// Dependencies: crate::{core, interfaces}, tokio
// ============================================================================

//! ## Overview
//! Each active run is owned by exactly one control task. The registry maps
//! the run identifier to that task's handle: a wake notifier, a cancellation
//! handle shared with its workers, and a channel publishing the final run
//! status. There is no process-wide "current run"; runs are independent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::sync::watch;

use crate::core::RunId;
use crate::core::RunStatus;
use crate::interfaces::CancelHandle;
use crate::interfaces::CancelSignal;
use crate::interfaces::cancellation;

// ============================================================================
// SECTION: Run Handle
// ============================================================================

/// Signals shared between operator calls and one run's control task.
#[derive(Debug)]
pub struct RunHandle {
    /// Wakes the control task to re-read run state.
    wake: Notify,
    /// Cancellation shared with in-flight workers.
    cancel: CancelHandle,
    /// Final run status once the control task exits.
    finished: watch::Sender<Option<RunStatus>>,
}

impl RunHandle {
    /// Creates a fresh handle.
    fn new() -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            wake: Notify::new(),
            cancel: cancellation().0,
            finished,
        }
    }

    /// Wakes the control task. A wake sent while it is busy is kept.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Completes on the next wake.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Signals cancellation to the control task and its workers.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.wake();
    }

    /// Returns true once cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns a cancellation signal for a worker.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.signal()
    }

    /// Publishes the final status (or `None` when the task stopped on error).
    pub fn finish(&self, status: Option<RunStatus>) {
        self.finished.send_replace(status);
    }

    /// Subscribes to the final status.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<RunStatus>> {
        self.finished.subscribe()
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Live control task handles keyed by run identifier.
#[derive(Debug, Default)]
pub struct RunRegistry {
    /// Handles for runs with a live control task.
    runs: Mutex<BTreeMap<RunId, Arc<RunHandle>>>,
}

impl RunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new control task for `run_id`.
    ///
    /// Returns `None` when a task is already registered.
    pub fn register(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        let mut runs = self.runs.lock().ok()?;
        match runs.entry(run_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(Arc::clone(slot.insert(Arc::new(RunHandle::new())))),
        }
    }

    /// Returns the handle for a run with a live control task.
    #[must_use]
    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs.lock().ok()?.get(run_id).cloned()
    }

    /// Removes a run's handle when its control task exits.
    pub fn remove(&self, run_id: &RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }

    /// Returns the runs with a live control task.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs.lock().map(|runs| runs.keys().cloned().collect()).unwrap_or_default()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
