// crates/policy-rollout-core/src/runtime/mod.rs
// ============================================================================
// Module: Policy Rollout Runtime
// Description: Planner, executor, workers, gates, recorder, and read API.
// Purpose: Orchestrate staged policy rollouts against the core interfaces.
// Dependencies: crate::{core, interfaces}, tokio, tracing
// ============================================================================

//! ## Overview
//! Runtime modules implement the orchestration state machine. Every state
//! change flows through the [`crate::StateStore`] conditional primitives;
//! no runtime component keeps authoritative state of its own.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod executor;
pub mod gate;
pub mod planner;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod status;
pub mod store;
pub mod worker;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use executor::DEFAULT_GATE_RECHECK_INTERVAL;
pub use executor::DEFAULT_MAX_CONCURRENCY;
pub use executor::ExecutorConfig;
pub use executor::ExecutorError;
pub use executor::RecoveryReport;
pub use executor::RolloutExecutor;
pub use executor::RolloutExecutorBuilder;
pub use executor::RunOperation;
pub use gate::OpenGate;
pub use gate::RecordedReferenceSource;
pub use gate::ReferenceFreshnessGate;
pub use planner::PlannerError;
pub use planner::RolloutPlanner;
pub use planner::ValidationError;
pub use recorder::EventRecorder;
pub use recorder::FileEventSink;
pub use recorder::NoopEventSink;
pub use recorder::StderrEventSink;
pub use registry::RunHandle;
pub use registry::RunRegistry;
pub use retry::RetryPolicy;
pub use retry::retry_on_conflict;
pub use status::StatusConfig;
pub use status::StatusError;
pub use status::StatusService;
pub use store::InMemoryStateStore;
pub use store::SharedStateStore;
pub use store::validate_run_transition;
pub use worker::DEFAULT_APPLY_TIMEOUT;
pub use worker::TargetOutcome;
pub use worker::TargetWorker;
pub use worker::WorkerConfig;
pub use worker::WorkerError;
