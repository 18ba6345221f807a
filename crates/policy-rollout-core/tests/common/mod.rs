// crates/policy-rollout-core/tests/common/mod.rs
// =============================================================================
// Module: Rollout Test Helpers
// Description: Request builders, scripted appliers, and polling helpers.
// Purpose: Reduce duplication across policy-rollout-core integration tests.
// =============================================================================

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test helpers are selectively used across suites."
)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use policy_rollout_core::ApplyError;
use policy_rollout_core::ApplyReceipt;
use policy_rollout_core::ApplyRequest;
use policy_rollout_core::CancelSignal;
use policy_rollout_core::DEFAULT_HASH_ALGORITHM;
use policy_rollout_core::EventQuery;
use policy_rollout_core::EventType;
use policy_rollout_core::ExecutorConfig;
use policy_rollout_core::FailureThreshold;
use policy_rollout_core::InMemoryStateStore;
use policy_rollout_core::PolicyApplier;
use policy_rollout_core::PolicyArtifact;
use policy_rollout_core::RetryPolicy;
use policy_rollout_core::RolloutEvent;
use policy_rollout_core::RolloutExecutor;
use policy_rollout_core::RolloutRequest;
use policy_rollout_core::RolloutTarget;
use policy_rollout_core::RunId;
use policy_rollout_core::SharedStateStore;
use policy_rollout_core::StageDefinition;
use policy_rollout_core::StageId;
use policy_rollout_core::StateStore;
use policy_rollout_core::TargetSelector;
use policy_rollout_core::WorkerConfig;
use policy_rollout_core::hash_bytes;
use tokio::sync::Semaphore;

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Builds a request with one hostname-list stage per entry (sequencing 1..).
pub fn request(run_id: &str, stages: &[&[&str]]) -> RolloutRequest {
    let mut targets = Vec::new();
    let mut definitions = Vec::new();
    for (index, hosts) in stages.iter().enumerate() {
        let sequencing = i64::try_from(index).unwrap() + 1;
        definitions.push(StageDefinition {
            name: format!("stage-{sequencing}"),
            sequencing,
            target_selector: TargetSelector::Hostnames {
                hostnames: hosts.iter().map(ToString::to_string).collect(),
            },
            failure_threshold: None,
        });
        targets.extend(hosts.iter().map(ToString::to_string));
    }
    let artifacts = artifacts_for(&targets);
    RolloutRequest {
        run_id: Some(RunId::new(run_id)),
        initiated_by: "netops".to_string(),
        dry_run: false,
        failure_threshold: None,
        targets,
        stages: definitions,
        artifacts,
    }
}

/// Generates one artifact per hostname.
pub fn artifacts_for(hostnames: &[String]) -> BTreeMap<String, PolicyArtifact> {
    hostnames
        .iter()
        .map(|host| {
            (host.clone(), PolicyArtifact::from_content(format!("! policy for {host}\nroute-map IMPORT permit 10\n")))
        })
        .collect()
}

/// Returns a fresh shared in-memory store.
pub fn memory_store() -> SharedStateStore {
    SharedStateStore::from_store(InMemoryStateStore::new())
}

/// Executor config with millisecond-scale timings.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        max_concurrency: 5,
        failure_threshold: FailureThreshold::STRICT,
        gate_recheck_interval: Duration::from_millis(10),
        worker: WorkerConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            apply_timeout: Duration::from_secs(5),
        },
    }
}

/// Builds an executor over `store` with `applier` and `config`.
pub fn executor(
    store: &SharedStateStore,
    applier: Arc<ScriptedApplier>,
    config: ExecutorConfig,
) -> RolloutExecutor {
    RolloutExecutor::builder(store.clone(), applier).config(config).build().unwrap()
}

// ============================================================================
// SECTION: Scripted Applier
// ============================================================================

/// Per-hostname applier behavior.
#[derive(Clone)]
pub enum Behavior {
    /// Report the artifact's own hash.
    Succeed,
    /// Report a hash that differs from the artifact.
    WrongHash,
    /// Fail permanently.
    Permanent,
    /// Fail transiently this many times, then succeed.
    TransientTimes(u32),
    /// Always fail transiently.
    AlwaysTransient,
    /// Sleep, then succeed.
    Sleep(Duration),
    /// Wait for a permit, then succeed. Ignores cancellation.
    Hold(Arc<Semaphore>),
    /// Wait for cancellation, then report it.
    UntilCancelled,
}

/// Recorded apply call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCall {
    /// Hostname applied.
    pub hostname: String,
    /// Dry-run flag.
    pub dry_run: bool,
}

/// Applier driven by per-hostname behaviors.
#[derive(Default)]
pub struct ScriptedApplier {
    /// Behavior per hostname; unknown hosts succeed.
    behaviors: Mutex<BTreeMap<String, Behavior>>,
    /// Transient failures already returned per hostname.
    failures: Mutex<BTreeMap<String, u32>>,
    /// Every call in arrival order.
    calls: Mutex<Vec<ApplyCall>>,
    /// Applies currently running.
    in_flight: AtomicUsize,
    /// Peak of `in_flight`.
    max_in_flight: AtomicUsize,
}

impl ScriptedApplier {
    /// Creates an applier where every host succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets a hostname's behavior.
    pub fn set(&self, hostname: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(hostname.to_string(), behavior);
    }

    /// Returns recorded calls.
    pub fn calls(&self) -> Vec<ApplyCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Returns how many times a hostname was applied.
    pub fn call_count(&self, hostname: &str) -> usize {
        self.calls().iter().filter(|call| call.hostname == hostname).count()
    }

    /// Returns the highest observed number of concurrent applies.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the behavior configured for `hostname`.
    fn behavior(&self, hostname: &str) -> Behavior {
        self.behaviors.lock().unwrap().get(hostname).cloned().unwrap_or(Behavior::Succeed)
    }

    /// Executes the configured behavior.
    async fn run(
        &self,
        request: &ApplyRequest,
        mut cancel: CancelSignal,
    ) -> Result<ApplyReceipt, ApplyError> {
        let own_hash = request.artifact.content_hash.clone();
        match self.behavior(&request.hostname) {
            Behavior::Succeed => Ok(ApplyReceipt {
                policy_hash: own_hash,
            }),
            Behavior::WrongHash => Ok(ApplyReceipt {
                policy_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"drifted running-config"),
            }),
            Behavior::Permanent => Err(ApplyError::Permanent("authentication rejected".to_string())),
            Behavior::TransientTimes(times) => {
                let mut failures = self.failures.lock().unwrap();
                let seen = failures.entry(request.hostname.clone()).or_default();
                if *seen < times {
                    *seen += 1;
                    Err(ApplyError::Transient("connection reset".to_string()))
                } else {
                    Ok(ApplyReceipt {
                        policy_hash: own_hash,
                    })
                }
            }
            Behavior::AlwaysTransient => Err(ApplyError::Transient("connection reset".to_string())),
            Behavior::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ApplyReceipt {
                    policy_hash: own_hash,
                })
            }
            Behavior::Hold(permits) => {
                permits.acquire().await.unwrap().forget();
                Ok(ApplyReceipt {
                    policy_hash: own_hash,
                })
            }
            Behavior::UntilCancelled => {
                cancel.cancelled().await;
                Err(ApplyError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl PolicyApplier for ScriptedApplier {
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: CancelSignal,
    ) -> Result<ApplyReceipt, ApplyError> {
        self.calls.lock().unwrap().push(ApplyCall {
            hostname: request.hostname.clone(),
            dry_run: request.dry_run,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.run(&request, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// SECTION: Store Queries
// ============================================================================

/// Returns every target of a stage.
pub fn targets(store: &SharedStateStore, run_id: &str, sequencing: i64) -> Vec<RolloutTarget> {
    store.list_targets(&StageId::for_stage(&RunId::new(run_id), sequencing)).unwrap()
}

/// Returns a single target by hostname.
pub fn target(store: &SharedStateStore, run_id: &str, sequencing: i64, host: &str) -> RolloutTarget {
    targets(store, run_id, sequencing).into_iter().find(|target| target.hostname == host).unwrap()
}

/// Returns a run's events of one type, oldest first.
pub fn events_of(store: &SharedStateStore, run_id: &str, event_type: EventType) -> Vec<RolloutEvent> {
    let query = EventQuery::recent(RunId::new(run_id), usize::MAX).of_type(event_type);
    let mut events = store.list_events(&query).unwrap();
    events.reverse();
    events
}

/// Polls `check` until it returns true or five seconds elapse.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Awaits `future` with a five second ceiling.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future).await.expect("operation timed out")
}
