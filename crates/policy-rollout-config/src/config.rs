// crates/policy-rollout-config/src/config.rs
// ============================================================================
// Module: Rollout Configuration
// Description: TOML config model, loader, validation, and builders.
// Purpose: Provide strict, fail-closed configuration for rollout hosts.
// Dependencies: policy-rollout-core, policy-rollout-store-sqlite, serde, toml, tracing
// ============================================================================

//! ## Overview
//! [`RolloutConfig`] is the canonical configuration for a rollout host.
//! Loading resolves the path (argument, then [`CONFIG_ENV_VAR`], then
//! [`DEFAULT_CONFIG_NAME`]), enforces path and size limits, parses TOML, and
//! validates every section. Missing sections take defaults; unknown keys are
//! rejected.
//!
//! Security posture: config files are untrusted input. Oversized files,
//! non-UTF-8 content, and out-of-range values are rejected before any
//! runtime component is built.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use policy_rollout_core::EventSink;
use policy_rollout_core::ExecutorConfig;
use policy_rollout_core::FailureThreshold;
use policy_rollout_core::FileEventSink;
use policy_rollout_core::InMemoryStateStore;
use policy_rollout_core::NoopEventSink;
use policy_rollout_core::OpenGate;
use policy_rollout_core::ReferenceDataSource;
use policy_rollout_core::ReferenceFreshnessGate;
use policy_rollout_core::RetryPolicy;
use policy_rollout_core::SafetyGate;
use policy_rollout_core::SharedStateStore;
use policy_rollout_core::StatusConfig;
use policy_rollout_core::StderrEventSink;
use policy_rollout_core::WorkerConfig;
use policy_rollout_store_sqlite::SqliteStateStore;
use policy_rollout_store_sqlite::SqliteStoreConfig;
use policy_rollout_store_sqlite::SqliteStoreMode;
use policy_rollout_store_sqlite::SqliteSyncMode;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "POLICY_ROLLOUT_CONFIG";
/// Config file used when neither an argument nor the env var is set.
pub const DEFAULT_CONFIG_NAME: &str = "policy-rollout.toml";
/// Maximum config file size in bytes.
pub const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Upper bound for per-stage concurrency.
const MAX_CONCURRENCY: usize = 1024;
/// Upper bound for attempts per target.
const MAX_ATTEMPTS: u32 = 100;
/// Upper bound for the per-apply deadline (one hour).
const MAX_APPLY_TIMEOUT_MS: u64 = 3_600_000;
/// Upper bound for `status.max_list_limit`.
const MAX_STATUS_LIST_LIMIT: usize = 10_000;
/// Upper bound for the `SQLite` read pool.
const MAX_READ_POOL_SIZE: usize = 64;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Config file is not valid TOML for the model.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Config value violates a constraint.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Runtime component could not be built from valid config.
    #[error("config build error: {0}")]
    Build(String),
}

/// Shorthand for [`ConfigError::Invalid`].
fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Root configuration for a rollout host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolloutConfig {
    /// Stage executor settings.
    pub executor: ExecutorSettings,
    /// Target worker retry and deadline settings.
    pub worker: WorkerSettings,
    /// State store backend.
    pub state_store: StateStoreConfig,
    /// Read API limits.
    pub status: StatusSettings,
    /// Audit event sink.
    pub audit: AuditConfig,
    /// Pre-stage safety gate.
    pub safety_gate: SafetyGateConfig,
}

impl RolloutConfig {
    /// Loads and validates configuration.
    ///
    /// The path is `path` when given, else the value of [`CONFIG_ENV_VAR`],
    /// else [`DEFAULT_CONFIG_NAME`] in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the path is unsafe, the file is too large
    /// or not UTF-8, parsing fails, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = resolve_config_path(path);
        validate_config_path(&path)?;
        let bytes = read_config_bytes(&path)?;
        let content =
            std::str::from_utf8(&bytes).map_err(|_| invalid("config file must be utf-8"))?;
        let config = Self::from_toml_str(content)?;
        info!(path = %path.display(), "rollout config loaded");
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.worker.validate()?;
        self.state_store.validate()?;
        self.status.validate()?;
        self.audit.validate()?;
        self.safety_gate.validate()?;
        Ok(())
    }

    /// Builds the executor configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is out of range.
    pub fn executor_config(&self) -> Result<ExecutorConfig, ConfigError> {
        let failure_threshold = FailureThreshold::new(self.executor.failure_threshold)
            .ok_or_else(|| invalid("executor.failure_threshold must be within 0.0..=1.0"))?;
        let config = ExecutorConfig {
            max_concurrency: self.executor.max_concurrency,
            failure_threshold,
            gate_recheck_interval: Duration::from_millis(self.executor.gate_recheck_interval_ms),
            worker: WorkerConfig {
                retry: RetryPolicy {
                    max_attempts: self.worker.max_attempts,
                    initial_backoff: Duration::from_millis(self.worker.initial_backoff_ms),
                    max_backoff: Duration::from_millis(self.worker.max_backoff_ms),
                },
                apply_timeout: Duration::from_millis(self.worker.apply_timeout_ms),
            },
        };
        config.validate().map_err(|err| invalid(err.to_string()))?;
        Ok(config)
    }

    /// Builds the status service limits.
    #[must_use]
    pub const fn status_config(&self) -> StatusConfig {
        StatusConfig {
            recent_events_limit: self.status.recent_events_limit,
            max_list_limit: self.status.max_list_limit,
        }
    }
}

// ============================================================================
// SECTION: Executor and Worker
// ============================================================================

/// `[executor]` section.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Maximum in-flight workers per stage.
    pub max_concurrency: usize,
    /// Default run failure threshold.
    pub failure_threshold: f64,
    /// Safety gate re-check interval while blocked.
    pub gate_recheck_interval_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            failure_threshold: 0.0,
            gate_recheck_interval_ms: 30_000,
        }
    }
}

impl ExecutorSettings {
    /// Validates executor bounds.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY {
            return Err(invalid(format!(
                "executor.max_concurrency must be between 1 and {MAX_CONCURRENCY}"
            )));
        }
        if FailureThreshold::new(self.failure_threshold).is_none() {
            return Err(invalid("executor.failure_threshold must be within 0.0..=1.0"));
        }
        if self.gate_recheck_interval_ms == 0 {
            return Err(invalid("executor.gate_recheck_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Total attempts per target, first try included.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
    /// Deadline for one apply call.
    pub apply_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            apply_timeout_ms: 120_000,
        }
    }
}

impl WorkerSettings {
    /// Validates retry and deadline bounds.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS {
            return Err(invalid(format!("worker.max_attempts must be between 1 and {MAX_ATTEMPTS}")));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid("worker.max_backoff_ms must be >= worker.initial_backoff_ms"));
        }
        if self.apply_timeout_ms == 0 || self.apply_timeout_ms > MAX_APPLY_TIMEOUT_MS {
            return Err(invalid(format!(
                "worker.apply_timeout_ms must be between 1 and {MAX_APPLY_TIMEOUT_MS}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: State Store
// ============================================================================

/// State store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreType {
    /// Process-local store; state is lost on exit.
    #[default]
    Memory,
    /// Durable `SQLite` store.
    Sqlite,
}

/// `[state_store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateStoreConfig {
    /// Backend type.
    #[serde(rename = "type")]
    pub store_type: StateStoreType,
    /// Database path (sqlite only).
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds (sqlite only).
    pub busy_timeout_ms: u64,
    /// Journal mode (sqlite only).
    pub journal_mode: SqliteStoreMode,
    /// Sync mode (sqlite only).
    pub sync_mode: SqliteSyncMode,
    /// Read connection count (sqlite only).
    pub read_pool_size: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            store_type: StateStoreType::Memory,
            path: None,
            busy_timeout_ms: 5_000,
            journal_mode: SqliteStoreMode::Wal,
            sync_mode: SqliteSyncMode::Full,
            read_pool_size: 4,
        }
    }
}

impl StateStoreConfig {
    /// Validates backend-specific requirements.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.store_type, &self.path) {
            (StateStoreType::Memory, Some(_)) => {
                return Err(invalid("state_store.path is only valid for sqlite"));
            }
            (StateStoreType::Sqlite, None) => {
                return Err(invalid("state_store.path is required for sqlite"));
            }
            (StateStoreType::Sqlite, Some(path)) if path.as_os_str().is_empty() => {
                return Err(invalid("state_store.path must be non-empty"));
            }
            _ => {}
        }
        if self.read_pool_size == 0 || self.read_pool_size > MAX_READ_POOL_SIZE {
            return Err(invalid(format!(
                "state_store.read_pool_size must be between 1 and {MAX_READ_POOL_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Builds the configured state store.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a sqlite store without a path and
/// [`ConfigError::Build`] when the database cannot be opened.
pub fn build_state_store(config: &StateStoreConfig) -> Result<SharedStateStore, ConfigError> {
    match config.store_type {
        StateStoreType::Memory => Ok(SharedStateStore::from_store(InMemoryStateStore::new())),
        StateStoreType::Sqlite => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| invalid("state_store.path is required for sqlite"))?;
            let store = SqliteStateStore::new(&SqliteStoreConfig {
                path,
                busy_timeout_ms: config.busy_timeout_ms,
                journal_mode: config.journal_mode,
                sync_mode: config.sync_mode,
                read_pool_size: config.read_pool_size,
            })
            .map_err(|err| ConfigError::Build(err.to_string()))?;
            Ok(SharedStateStore::from_store(store))
        }
    }
}

// ============================================================================
// SECTION: Status
// ============================================================================

/// `[status]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSettings {
    /// Events included in a run summary.
    pub recent_events_limit: usize,
    /// Largest accepted list limit.
    pub max_list_limit: usize,
}

impl Default for StatusSettings {
    fn default() -> Self {
        let defaults = StatusConfig::default();
        Self {
            recent_events_limit: defaults.recent_events_limit,
            max_list_limit: defaults.max_list_limit,
        }
    }
}

impl StatusSettings {
    /// Validates read API limits.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_list_limit == 0 || self.max_list_limit > MAX_STATUS_LIST_LIMIT {
            return Err(invalid(format!(
                "status.max_list_limit must be between 1 and {MAX_STATUS_LIST_LIMIT}"
            )));
        }
        if self.recent_events_limit == 0 || self.recent_events_limit > self.max_list_limit {
            return Err(invalid("status.recent_events_limit must be between 1 and max_list_limit"));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Audit
// ============================================================================

/// Audit sink kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSinkKind {
    /// Events are only persisted in the state store.
    #[default]
    None,
    /// JSON lines on stderr.
    Stderr,
    /// Append-only JSON lines file.
    File,
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Sink kind.
    pub sink: AuditSinkKind,
    /// Audit file path (file sink only).
    pub path: Option<PathBuf>,
}

impl AuditConfig {
    /// Validates sink-specific requirements.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (AuditSinkKind::File, None) => Err(invalid("audit.path is required for file sink")),
            (AuditSinkKind::File, Some(path)) if path.as_os_str().is_empty() => {
                Err(invalid("audit.path must be non-empty"))
            }
            (AuditSinkKind::None | AuditSinkKind::Stderr, Some(_)) => {
                Err(invalid("audit.path is only valid for file sink"))
            }
            _ => Ok(()),
        }
    }
}

/// Builds the configured audit sink.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a file sink without a path and
/// [`ConfigError::Io`] when the audit file cannot be opened.
pub fn build_event_sink(config: &AuditConfig) -> Result<Arc<dyn EventSink>, ConfigError> {
    match config.sink {
        AuditSinkKind::None => Ok(Arc::new(NoopEventSink)),
        AuditSinkKind::Stderr => Ok(Arc::new(StderrEventSink)),
        AuditSinkKind::File => {
            let path =
                config.path.as_deref().ok_or_else(|| invalid("audit.path is required for file sink"))?;
            let sink = FileEventSink::new(path).map_err(|err| ConfigError::Io(err.to_string()))?;
            Ok(Arc::new(sink))
        }
    }
}

// ============================================================================
// SECTION: Safety Gate
// ============================================================================

/// Safety gate kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyGateKind {
    /// Never blocks.
    #[default]
    Open,
    /// Blocks while reference data is stale.
    ReferenceFreshness,
}

/// `[safety_gate]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyGateConfig {
    /// Gate kind.
    pub kind: SafetyGateKind,
    /// Maximum reference data age (`reference_freshness` only).
    pub max_age_secs: Option<u64>,
}

impl SafetyGateConfig {
    /// Validates gate-specific requirements.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.kind, self.max_age_secs) {
            (SafetyGateKind::ReferenceFreshness, None | Some(0)) => Err(invalid(
                "safety_gate.max_age_secs must be > 0 for reference_freshness",
            )),
            (SafetyGateKind::Open, Some(_)) => {
                Err(invalid("safety_gate.max_age_secs is only valid for reference_freshness"))
            }
            _ => Ok(()),
        }
    }
}

/// Builds the configured safety gate over `source`.
///
/// `source` is only consulted by the reference freshness gate.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when a freshness gate lacks `max_age_secs`.
pub fn build_safety_gate(
    config: &SafetyGateConfig,
    source: Arc<dyn ReferenceDataSource>,
) -> Result<Arc<dyn SafetyGate>, ConfigError> {
    match config.kind {
        SafetyGateKind::Open => Ok(Arc::new(OpenGate)),
        SafetyGateKind::ReferenceFreshness => {
            let max_age = config
                .max_age_secs
                .filter(|secs| *secs > 0)
                .ok_or_else(|| invalid("safety_gate.max_age_secs must be > 0 for reference_freshness"))?;
            Ok(Arc::new(ReferenceFreshnessGate::new(source, Duration::from_secs(max_age))))
        }
    }
}

// ============================================================================
// SECTION: Loading
// ============================================================================

/// Resolves the config path from the argument, env var, or default name.
fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CONFIG_NAME),
    }
}

/// Rejects empty and overlong config paths.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(invalid("config path must not be empty"));
    }
    if path.as_os_str().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(invalid("config path exceeds max length"));
    }
    if path.components().any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH) {
        return Err(invalid("config path component too long"));
    }
    Ok(())
}

/// Reads the config file, refusing anything over [`MAX_CONFIG_FILE_BYTES`].
fn read_config_bytes(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let file = File::open(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    let metadata = file.metadata().map_err(|err| ConfigError::Io(err.to_string()))?;
    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        return Err(invalid("config file exceeds size limit"));
    }
    let mut bytes = Vec::new();
    file.take(MAX_CONFIG_FILE_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| ConfigError::Io(err.to_string()))?;
    if !u64::try_from(bytes.len()).is_ok_and(|len| len <= MAX_CONFIG_FILE_BYTES) {
        return Err(invalid("config file exceeds size limit"));
    }
    Ok(bytes)
}
