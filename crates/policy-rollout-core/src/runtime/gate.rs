// crates/policy-rollout-core/src/runtime/gate.rs
// ============================================================================
// Module: Policy Rollout Safety Gates
// Description: Built-in pre-stage safety gate implementations.
// Purpose: Block stage dispatch when routing-security reference data is stale.
// Dependencies: crate::{core, interfaces}, tracing
// ============================================================================

//! ## Overview
//! Gates are pure read-only predicates. [`ReferenceFreshnessGate`] fails
//! closed: missing data, an unreadable source, or data older than the
//! configured age all block the stage.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::core::Timestamp;
use crate::interfaces::GateContext;
use crate::interfaces::GateDecision;
use crate::interfaces::ReferenceDataError;
use crate::interfaces::ReferenceDataSource;
use crate::interfaces::SafetyGate;

// ============================================================================
// SECTION: Open Gate
// ============================================================================

/// Gate that never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl SafetyGate for OpenGate {
    fn check(&self, _context: &GateContext) -> GateDecision {
        GateDecision::Clear
    }
}

// ============================================================================
// SECTION: Reference Freshness Gate
// ============================================================================

/// Blocks stages while reference data (RPKI/IRR snapshots) is older than `max_age`.
pub struct ReferenceFreshnessGate {
    /// Freshness source.
    source: Arc<dyn ReferenceDataSource>,
    /// Maximum tolerated age.
    max_age: Duration,
}

impl ReferenceFreshnessGate {
    /// Creates a freshness gate.
    #[must_use]
    pub fn new(source: Arc<dyn ReferenceDataSource>, max_age: Duration) -> Self {
        Self {
            source,
            max_age,
        }
    }
}

impl SafetyGate for ReferenceFreshnessGate {
    fn check(&self, context: &GateContext) -> GateDecision {
        let refreshed = match self.source.last_refreshed() {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => {
                return GateDecision::Blocked {
                    reason: "reference data has never been refreshed".to_string(),
                };
            }
            Err(err) => {
                return GateDecision::Blocked {
                    reason: err.to_string(),
                };
            }
        };
        let age_millis = context.now.millis_since(refreshed);
        if u128::from(age_millis) > self.max_age.as_millis() {
            debug!(
                stage_id = %context.stage_id,
                age_ms = age_millis,
                max_age_secs = self.max_age.as_secs(),
                "reference data is stale"
            );
            // Reason must not vary with age; the executor records each distinct reason.
            return GateDecision::Blocked {
                reason: format!(
                    "reference data is stale: older than {}s",
                    self.max_age.as_secs()
                ),
            };
        }
        GateDecision::Clear
    }
}

// ============================================================================
// SECTION: Recorded Reference Source
// ============================================================================

/// Reference source updated by whoever refreshes the data.
#[derive(Debug, Default)]
pub struct RecordedReferenceSource {
    /// Last refresh time.
    refreshed: Mutex<Option<Timestamp>>,
}

impl RecordedReferenceSource {
    /// Creates a source with no refresh recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a refresh.
    pub fn record_refresh(&self, at: Timestamp) {
        if let Ok(mut guard) = self.refreshed.lock() {
            *guard = Some(at);
        }
    }
}

impl ReferenceDataSource for RecordedReferenceSource {
    fn last_refreshed(&self) -> Result<Option<Timestamp>, ReferenceDataError> {
        self.refreshed
            .lock()
            .map(|guard| *guard)
            .map_err(|_| ReferenceDataError("reference source lock poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
