// crates/policy-rollout-core/src/runtime/recorder.rs
// ============================================================================
// Module: Policy Rollout Event Recorder
// Description: Append-only event recording with pluggable audit mirrors.
// Purpose: Persist lifecycle events and mirror them to operator audit sinks.
// Dependencies: crate::{core, interfaces}, serde_json, tracing
// ============================================================================

//! ## Overview
//! [`EventRecorder::append`] writes the event through the state store (which
//! assigns the identifier and orders it within the run) and then mirrors the
//! stored event to an [`EventSink`]. Sink failures are swallowed; the store
//! is the audit record of truth.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::core::NewEvent;
use crate::core::RolloutEvent;
use crate::interfaces::EventSink;
use crate::interfaces::StateStore;
use crate::interfaces::StoreError;
use crate::runtime::store::SharedStateStore;

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// Appends lifecycle events to the state store and mirrors them to a sink.
#[derive(Clone)]
pub struct EventRecorder {
    /// Backing store.
    store: SharedStateStore,
    /// Audit mirror.
    sink: Arc<dyn EventSink>,
}

impl EventRecorder {
    /// Creates a recorder over `store` mirroring to `sink`.
    #[must_use]
    pub fn new(store: SharedStateStore, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
        }
    }

    /// Creates a recorder with no audit mirror.
    #[must_use]
    pub fn without_sink(store: SharedStateStore) -> Self {
        Self::new(store, Arc::new(NoopEventSink))
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the event.
    pub fn append(&self, event: NewEvent) -> Result<RolloutEvent, StoreError> {
        let recorded = self.store.append_event(event)?;
        debug!(
            run_id = %recorded.run_id,
            event_id = recorded.event_id.get(),
            event_type = %recorded.event_type(),
            "rollout event recorded"
        );
        self.sink.record(&recorded);
        Ok(recorded)
    }
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink that writes JSON lines to stderr.
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn record(&self, event: &RolloutEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(io::stderr(), "{payload}");
        }
    }
}

/// Sink that appends JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<File>,
}

impl FileEventSink {
    /// Opens the audit file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for FileEventSink {
    fn record(&self, event: &RolloutEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op sink.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: &RolloutEvent) {}
}

// ============================================================================
// SECTION: Tests
// ============================================================================
