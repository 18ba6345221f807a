// crates/policy-rollout-core/src/lib.rs
// ============================================================================
// Module: Policy Rollout Core Library
// Description: Public API surface for the policy rollout orchestrator.
// Purpose: Expose core types, collaborator interfaces, and the runtime.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Policy rollout core stages generated routing-policy artifacts across a
//! fleet of routers. It plans runs atomically, executes stages in order with
//! bounded per-stage concurrency, enforces safety gates and failure
//! thresholds, and keeps all state in a pluggable [`StateStore`] so a run
//! can resume after a restart.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::ApplyError;
pub use interfaces::ApplyReceipt;
pub use interfaces::ApplyRequest;
pub use interfaces::CancelHandle;
pub use interfaces::CancelSignal;
pub use interfaces::EventSink;
pub use interfaces::GateContext;
pub use interfaces::GateDecision;
pub use interfaces::PolicyApplier;
pub use interfaces::ReferenceDataError;
pub use interfaces::ReferenceDataSource;
pub use interfaces::SafetyGate;
pub use interfaces::StateStore;
pub use interfaces::StoreError;
pub use interfaces::cancellation;
pub use runtime::EventRecorder;
pub use runtime::ExecutorConfig;
pub use runtime::ExecutorError;
pub use runtime::FileEventSink;
pub use runtime::InMemoryStateStore;
pub use runtime::NoopEventSink;
pub use runtime::OpenGate;
pub use runtime::PlannerError;
pub use runtime::RecordedReferenceSource;
pub use runtime::RecoveryReport;
pub use runtime::ReferenceFreshnessGate;
pub use runtime::RetryPolicy;
pub use runtime::RolloutExecutor;
pub use runtime::RolloutExecutorBuilder;
pub use runtime::RolloutPlanner;
pub use runtime::RunOperation;
pub use runtime::SharedStateStore;
pub use runtime::StatusConfig;
pub use runtime::StatusError;
pub use runtime::StatusService;
pub use runtime::StderrEventSink;
pub use runtime::TargetOutcome;
pub use runtime::TargetWorker;
pub use runtime::ValidationError;
pub use runtime::WorkerConfig;
pub use runtime::WorkerError;
