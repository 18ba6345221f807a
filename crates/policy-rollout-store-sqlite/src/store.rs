// crates/policy-rollout-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Rollout State Store
// Description: Durable StateStore backed by SQLite WAL.
// Purpose: Persist runs, stages, targets, and events with guarded transitions.
// Dependencies: policy-rollout-core, rusqlite, serde, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! This module implements a durable [`StateStore`] using `SQLite`. Every write
//! runs inside an `IMMEDIATE` transaction on a single writer connection;
//! conditional target and run transitions are `UPDATE ... WHERE state = ?`
//! statements, so two writers can never both win the same transition. Reads
//! use a small pool of separate connections and never wait on the writer
//! under WAL. Stored rows are untrusted: every label, digest, and payload is
//! parsed on load and fails closed as [`SqliteStoreError::Corrupt`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use policy_rollout_core::EventId;
use policy_rollout_core::EventPayload;
use policy_rollout_core::EventQuery;
use policy_rollout_core::FailureThreshold;
use policy_rollout_core::HashDigest;
use policy_rollout_core::NewEvent;
use policy_rollout_core::PolicyArtifact;
use policy_rollout_core::RolloutEvent;
use policy_rollout_core::RolloutRun;
use policy_rollout_core::RolloutStage;
use policy_rollout_core::RolloutTarget;
use policy_rollout_core::RunId;
use policy_rollout_core::RunPlan;
use policy_rollout_core::RunStatus;
use policy_rollout_core::StageId;
use policy_rollout_core::StageStats;
use policy_rollout_core::StageWithStats;
use policy_rollout_core::StateStore;
use policy_rollout_core::StoreError;
use policy_rollout_core::TargetId;
use policy_rollout_core::TargetMutation;
use policy_rollout_core::TargetSelector;
use policy_rollout_core::TargetState;
use policy_rollout_core::Timestamp;
use policy_rollout_core::runtime::validate_run_transition;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
pub const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default number of read connections.
const DEFAULT_READ_POOL_SIZE: usize = 4;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// Run columns in [`decode_run`] order.
const RUN_COLUMNS: &str =
    "run_id, status, created_at, updated_at, initiated_by, dry_run, failure_threshold";
/// Stage columns in [`decode_stage`] order.
const STAGE_COLUMNS: &str =
    "stage_id, run_id, sequencing, name, target_selector_json, failure_threshold";
/// Target columns in [`decode_target`] order.
const TARGET_COLUMNS: &str = "target_id, stage_id, run_id, hostname, state, planned_hash, \
                              policy_hash, attempt_count, last_error, updated_at";
/// Event columns in [`decode_event`] order.
const EVENT_COLUMNS: &str = "event_id, run_id, stage_id, target_id, event_type, timestamp, \
                             payload_json";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` state store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
/// - `read_pool_size` must be greater than zero.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Number of read-only connections used for read path isolation.
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
}

impl SqliteStoreConfig {
    /// Returns a configuration with defaults for `path`.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
            read_pool_size: DEFAULT_READ_POOL_SIZE,
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default read connection pool size.
const fn default_read_pool_size() -> usize {
    DEFAULT_READ_POOL_SIZE
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
///
/// # Invariants
/// - Error messages avoid embedding artifact contents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Database busy or locked by another writer; safe to retry.
    #[error("sqlite store busy: {0}")]
    Busy(String),
    /// Stored row failed to parse.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid request or configuration.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Referenced row does not exist.
    #[error("sqlite store record not found: {0}")]
    NotFound(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Store(message),
            SqliteStoreError::Busy(message) => Self::Conflict(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::NotFound(message) => Self::NotFound(message),
        }
    }
}

/// Classifies a `rusqlite` error.
fn db_error(err: rusqlite::Error) -> SqliteStoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            debug!(error = %err, "sqlite contention");
            SqliteStoreError::Busy(err.to_string())
        }
        Some(ErrorCode::ConstraintViolation) => SqliteStoreError::Invalid(err.to_string()),
        _ => SqliteStoreError::Db(err.to_string()),
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed rollout state store with WAL support.
///
/// # Invariants
/// - All writes go through one connection inside `IMMEDIATE` transactions.
/// - Reads use pooled connections and never observe partial writes.
#[derive(Clone)]
pub struct SqliteStateStore {
    /// Writer connection guarded by a mutex.
    write_connection: Arc<Mutex<Connection>>,
    /// Read-only connection pool used for read path isolation under WAL.
    read_connections: Arc<Vec<Mutex<Connection>>>,
    /// Round-robin cursor for read connection selection.
    read_cursor: Arc<AtomicUsize>,
}

impl SqliteStateStore {
    /// Opens an `SQLite`-backed state store, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the path is unsafe or the database
    /// cannot be opened or initialized.
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        if config.read_pool_size == 0 {
            return Err(SqliteStoreError::Invalid(
                "read_pool_size must be greater than zero".to_string(),
            ));
        }
        ensure_parent_dir(&config.path)?;
        let mut write_connection = open_connection(config)?;
        initialize_schema(&mut write_connection)?;
        let mut read_connections = Vec::with_capacity(config.read_pool_size);
        for _ in 0 .. config.read_pool_size {
            read_connections.push(Mutex::new(open_connection(config)?));
        }
        info!(
            path = %config.path.display(),
            journal_mode = config.journal_mode.pragma_value(),
            read_pool_size = config.read_pool_size,
            "sqlite state store opened"
        );
        Ok(Self {
            write_connection: Arc::new(Mutex::new(write_connection)),
            read_connections: Arc::new(read_connections),
            read_cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns the next read connection using round-robin selection.
    fn read_connection(&self) -> &Mutex<Connection> {
        let len = self.read_connections.len();
        let index = self.read_cursor.fetch_add(1, Ordering::Relaxed) % len;
        &self.read_connections[index]
    }

    /// Runs `read` against a pooled read connection.
    fn read<T>(
        &self,
        read: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let guard = self
            .read_connection()
            .lock()
            .map_err(|_| SqliteStoreError::Io("sqlite read mutex poisoned".to_string()))?;
        read(&guard)
    }

    /// Runs `write` inside an `IMMEDIATE` transaction, committing on success.
    ///
    /// The transaction rolls back when `write` returns an error.
    fn write<T>(
        &self,
        write: impl FnOnce(&Transaction<'_>) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let mut guard = self
            .write_connection
            .lock()
            .map_err(|_| SqliteStoreError::Io("sqlite write mutex poisoned".to_string()))?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_error)?;
        let value = write(&tx)?;
        tx.commit().map_err(db_error)?;
        Ok(value)
    }
}

// ============================================================================
// SECTION: StateStore
// ============================================================================

impl StateStore for SqliteStateStore {
    fn create_run(&self, plan: &RunPlan) -> Result<(), StoreError> {
        self.write(|tx| insert_plan(tx, plan)).map_err(StoreError::from)
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<RolloutRun>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id.as_str()],
                RawRun::from_row,
            )
            .optional()
            .map_err(db_error)?
            .map(decode_run)
            .transpose()
        })
        .map_err(StoreError::from)
    }

    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RolloutRun>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE (?1 IS NULL OR status = ?1) ORDER BY \
                     created_at DESC, seq DESC LIMIT ?2"
                ))
                .map_err(db_error)?;
            let rows = stmt
                .query_map(params![status.map(RunStatus::as_str), sql_limit(limit)], RawRun::from_row)
                .map_err(db_error)?;
            rows.map(|row| row.map_err(db_error).and_then(decode_run)).collect()
        })
        .map_err(StoreError::from)
    }

    fn list_stages(&self, run_id: &RunId) -> Result<Vec<RolloutStage>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {STAGE_COLUMNS} FROM stages WHERE run_id = ?1 ORDER BY sequencing"
                ))
                .map_err(db_error)?;
            let rows = stmt.query_map(params![run_id.as_str()], RawStage::from_row).map_err(db_error)?;
            rows.map(|row| row.map_err(db_error).and_then(decode_stage)).collect()
        })
        .map_err(StoreError::from)
    }

    fn list_targets(&self, stage_id: &StageId) -> Result<Vec<RolloutTarget>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TARGET_COLUMNS} FROM targets WHERE stage_id = ?1 ORDER BY position"
                ))
                .map_err(db_error)?;
            let rows =
                stmt.query_map(params![stage_id.as_str()], RawTarget::from_row).map_err(db_error)?;
            rows.map(|row| row.map_err(db_error).and_then(decode_target)).collect()
        })
        .map_err(StoreError::from)
    }

    fn load_target(&self, target_id: &TargetId) -> Result<Option<RolloutTarget>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE target_id = ?1"),
                params![target_id.as_str()],
                RawTarget::from_row,
            )
            .optional()
            .map_err(db_error)?
            .map(decode_target)
            .transpose()
        })
        .map_err(StoreError::from)
    }

    fn load_artifact(&self, target_id: &TargetId) -> Result<Option<PolicyArtifact>, StoreError> {
        self.read(|conn| {
            let raw: Option<(String, String)> = conn
                .query_row(
                    "SELECT artifact_content, artifact_hash FROM targets WHERE target_id = ?1",
                    params![target_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_error)?;
            raw.map(|(content, hash)| {
                Ok(PolicyArtifact {
                    content,
                    content_hash: parse_digest(&hash)?,
                })
            })
            .transpose()
        })
        .map_err(StoreError::from)
    }

    fn update_target(&self, mutation: &TargetMutation) -> Result<bool, StoreError> {
        mutation.validate()?;
        self.write(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM targets WHERE target_id = ?1",
                    params![mutation.target_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;
            if current.is_none() {
                return Err(SqliteStoreError::NotFound(mutation.target_id.to_string()));
            }
            let changed = tx
                .execute(
                    "UPDATE targets SET state = ?1, updated_at = ?2, attempt_count = \
                     attempt_count + ?3, last_error = COALESCE(?4, last_error), policy_hash = \
                     COALESCE(?5, policy_hash) WHERE target_id = ?6 AND state = ?7",
                    params![
                        mutation.next.as_str(),
                        mutation.at.as_unix_millis(),
                        i64::from(mutation.increment_attempts),
                        mutation.last_error.as_deref(),
                        mutation.policy_hash.as_ref().map(ToString::to_string),
                        mutation.target_id.as_str(),
                        mutation.expected.as_str(),
                    ],
                )
                .map_err(db_error)?;
            Ok(changed == 1)
        })
        .map_err(StoreError::from)
    }

    fn skip_pending_targets(&self, run_id: &RunId, at: Timestamp) -> Result<u64, StoreError> {
        self.write(|tx| {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;
            let Some(status) = status else {
                return Err(SqliteStoreError::NotFound(run_id.to_string()));
            };
            if matches!(parse_label::<RunStatus>(&status)?, RunStatus::Completed | RunStatus::Failed)
            {
                return Ok(0);
            }
            let changed = tx
                .execute(
                    "UPDATE targets SET state = ?1, updated_at = ?2 WHERE run_id = ?3 AND state \
                     = ?4",
                    params![
                        TargetState::Skipped.as_str(),
                        at.as_unix_millis(),
                        run_id.as_str(),
                        TargetState::Pending.as_str(),
                    ],
                )
                .map_err(db_error)?;
            u64::try_from(changed).map_err(|_| SqliteStoreError::Db("row count overflow".to_string()))
        })
        .map_err(StoreError::from)
    }

    fn transition_run(
        &self,
        run_id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        validate_run_transition(from, to)?;
        self.write(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;
            let Some(current) = current else {
                return Err(SqliteStoreError::NotFound(run_id.to_string()));
            };
            let current = parse_label::<RunStatus>(&current)?;
            if !from.contains(&current) {
                return Ok(false);
            }
            let changed = tx
                .execute(
                    "UPDATE runs SET status = ?1, updated_at = ?2 WHERE run_id = ?3 AND status = ?4",
                    params![to.as_str(), at.as_unix_millis(), run_id.as_str(), current.as_str()],
                )
                .map_err(db_error)?;
            Ok(changed == 1)
        })
        .map_err(StoreError::from)
    }

    fn append_event(&self, event: NewEvent) -> Result<RolloutEvent, StoreError> {
        self.write(|tx| insert_event(tx, event)).map_err(StoreError::from)
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<RolloutEvent>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = ?1 AND (?2 IS NULL OR \
                     stage_id = ?2) AND (?3 IS NULL OR event_type = ?3) ORDER BY event_id DESC \
                     LIMIT ?4"
                ))
                .map_err(db_error)?;
            let rows = stmt
                .query_map(
                    params![
                        query.run_id.as_str(),
                        query.stage_id.as_ref().map(StageId::as_str),
                        query.event_type.map(|kind| kind.as_str()),
                        sql_limit(query.limit),
                    ],
                    RawEvent::from_row,
                )
                .map_err(db_error)?;
            rows.map(|row| row.map_err(db_error).and_then(decode_event)).collect()
        })
        .map_err(StoreError::from)
    }

    fn run_stage_stats(&self, run_id: &RunId) -> Result<Vec<StageWithStats>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT s.stage_id, s.run_id, s.sequencing, s.name, s.target_selector_json, \
                     s.failure_threshold, t.state, COUNT(t.target_id) FROM stages s LEFT JOIN \
                     targets t ON t.stage_id = s.stage_id WHERE s.run_id = ?1 GROUP BY \
                     s.stage_id, t.state ORDER BY s.sequencing",
                )
                .map_err(db_error)?;
            let rows = stmt
                .query_map(params![run_id.as_str()], |row| {
                    Ok((RawStage::from_row(row)?, row.get::<_, Option<String>>(6)?, row.get::<_, i64>(7)?))
                })
                .map_err(db_error)?;
            let mut stages: Vec<StageWithStats> = Vec::new();
            for row in rows {
                let (raw_stage, state, count) = row.map_err(db_error)?;
                if stages.last().is_none_or(|last| last.stage.stage_id.as_str() != raw_stage.stage_id)
                {
                    stages.push(StageWithStats {
                        stage: decode_stage(raw_stage)?,
                        stats: StageStats::default(),
                    });
                }
                let (Some(state), Some(entry)) = (state, stages.last_mut()) else {
                    continue;
                };
                let state = parse_label::<TargetState>(&state)?;
                let count = u64::try_from(count)
                    .map_err(|_| SqliteStoreError::Corrupt("negative target count".to_string()))?;
                entry.stats.add(state, count);
            }
            Ok(stages)
        })
        .map_err(StoreError::from)
    }

    fn readiness(&self) -> Result<(), StoreError> {
        self.read(check_connection)?;
        let guard = self
            .write_connection
            .lock()
            .map_err(|_| StoreError::Io("sqlite write mutex poisoned".to_string()))?;
        check_connection(&guard).map_err(StoreError::from)
    }
}

// ============================================================================
// SECTION: Writes
// ============================================================================

/// Inserts a run with all of its stages and targets.
fn insert_plan(tx: &Transaction<'_>, plan: &RunPlan) -> Result<(), SqliteStoreError> {
    let run = &plan.run;
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run.run_id.as_str()], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_error)?;
    if exists.is_some() {
        return Err(SqliteStoreError::Invalid(format!("run already exists: {}", run.run_id)));
    }
    tx.execute(
        "INSERT INTO runs (run_id, status, created_at, updated_at, initiated_by, dry_run, \
         failure_threshold) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.run_id.as_str(),
            run.status.as_str(),
            run.created_at.as_unix_millis(),
            run.updated_at.as_unix_millis(),
            run.initiated_by,
            run.dry_run,
            run.failure_threshold.get(),
        ],
    )
    .map_err(db_error)?;
    for planned_stage in &plan.stages {
        let stage = &planned_stage.stage;
        let selector = serde_json::to_string(&stage.target_selector)
            .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        tx.execute(
            "INSERT INTO stages (stage_id, run_id, sequencing, name, target_selector_json, \
             failure_threshold) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stage.stage_id.as_str(),
                stage.run_id.as_str(),
                stage.sequencing,
                stage.name,
                selector,
                stage.failure_threshold.map(FailureThreshold::get),
            ],
        )
        .map_err(db_error)?;
        for (position, planned) in planned_stage.targets.iter().enumerate() {
            let target = &planned.target;
            let position = i64::try_from(position)
                .map_err(|_| SqliteStoreError::Invalid("stage too large".to_string()))?;
            tx.execute(
                "INSERT INTO targets (target_id, stage_id, run_id, position, hostname, state, \
                 planned_hash, policy_hash, attempt_count, last_error, updated_at, \
                 artifact_content, artifact_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, \
                 ?10, ?11, ?12, ?13)",
                params![
                    target.target_id.as_str(),
                    target.stage_id.as_str(),
                    target.run_id.as_str(),
                    position,
                    target.hostname,
                    target.state.as_str(),
                    target.planned_hash.to_string(),
                    target.policy_hash.as_ref().map(ToString::to_string),
                    i64::from(target.attempt_count),
                    target.last_error.as_deref(),
                    target.updated_at.as_unix_millis(),
                    planned.artifact.content,
                    planned.artifact.content_hash.to_string(),
                ],
            )
            .map_err(db_error)?;
        }
    }
    Ok(())
}

/// Appends an event, clamping its timestamp to the run's latest event.
fn insert_event(tx: &Transaction<'_>, event: NewEvent) -> Result<RolloutEvent, SqliteStoreError> {
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![event.run_id.as_str()], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_error)?;
    if exists.is_none() {
        return Err(SqliteStoreError::NotFound(event.run_id.to_string()));
    }
    let latest: Option<i64> = tx
        .query_row(
            "SELECT MAX(timestamp) FROM events WHERE run_id = ?1",
            params![event.run_id.as_str()],
            |row| row.get(0),
        )
        .map_err(db_error)?;
    let timestamp = latest
        .map_or(event.timestamp, |latest| event.timestamp.max(Timestamp::from_unix_millis(latest)));
    let payload = serde_json::to_string(&event.payload)
        .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
    tx.execute(
        "INSERT INTO events (run_id, stage_id, target_id, event_type, timestamp, payload_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.run_id.as_str(),
            event.stage_id.as_ref().map(StageId::as_str),
            event.target_id.as_ref().map(TargetId::as_str),
            event.payload.event_type().as_str(),
            timestamp.as_unix_millis(),
            payload,
        ],
    )
    .map_err(db_error)?;
    let event_id = u64::try_from(tx.last_insert_rowid())
        .ok()
        .and_then(EventId::from_raw)
        .ok_or_else(|| SqliteStoreError::Corrupt("event id out of range".to_string()))?;
    Ok(RolloutEvent::from_new(event_id, timestamp, event))
}

// ============================================================================
// SECTION: Row Decoding
// ============================================================================

/// Raw `runs` row.
struct RawRun {
    /// Run identifier.
    run_id: String,
    /// Status label.
    status: String,
    /// Creation time.
    created_at: i64,
    /// Last status change.
    updated_at: i64,
    /// Initiator.
    initiated_by: String,
    /// Dry-run flag.
    dry_run: bool,
    /// Run threshold.
    failure_threshold: f64,
}

impl RawRun {
    /// Reads a row selected with [`RUN_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            status: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            initiated_by: row.get(4)?,
            dry_run: row.get(5)?,
            failure_threshold: row.get(6)?,
        })
    }
}

/// Raw `stages` row.
struct RawStage {
    /// Stage identifier.
    stage_id: String,
    /// Owning run.
    run_id: String,
    /// Execution order.
    sequencing: i64,
    /// Stage name.
    name: String,
    /// Serialized selector.
    target_selector_json: String,
    /// Optional stage threshold.
    failure_threshold: Option<f64>,
}

impl RawStage {
    /// Reads a row selected with [`STAGE_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            stage_id: row.get(0)?,
            run_id: row.get(1)?,
            sequencing: row.get(2)?,
            name: row.get(3)?,
            target_selector_json: row.get(4)?,
            failure_threshold: row.get(5)?,
        })
    }
}

/// Raw `targets` row.
struct RawTarget {
    /// Target identifier.
    target_id: String,
    /// Owning stage.
    stage_id: String,
    /// Owning run.
    run_id: String,
    /// Router hostname.
    hostname: String,
    /// State label.
    state: String,
    /// Planned digest text.
    planned_hash: String,
    /// Applied digest text.
    policy_hash: Option<String>,
    /// Attempts so far.
    attempt_count: i64,
    /// Last apply error.
    last_error: Option<String>,
    /// Last mutation time.
    updated_at: i64,
}

impl RawTarget {
    /// Reads a row selected with [`TARGET_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            target_id: row.get(0)?,
            stage_id: row.get(1)?,
            run_id: row.get(2)?,
            hostname: row.get(3)?,
            state: row.get(4)?,
            planned_hash: row.get(5)?,
            policy_hash: row.get(6)?,
            attempt_count: row.get(7)?,
            last_error: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// Raw `events` row.
struct RawEvent {
    /// Event identifier.
    event_id: i64,
    /// Owning run.
    run_id: String,
    /// Related stage.
    stage_id: Option<String>,
    /// Related target.
    target_id: Option<String>,
    /// Event type label.
    event_type: String,
    /// Event time.
    timestamp: i64,
    /// Serialized payload.
    payload_json: String,
}

impl RawEvent {
    /// Reads a row selected with [`EVENT_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            run_id: row.get(1)?,
            stage_id: row.get(2)?,
            target_id: row.get(3)?,
            event_type: row.get(4)?,
            timestamp: row.get(5)?,
            payload_json: row.get(6)?,
        })
    }
}

/// Decodes a run row.
fn decode_run(raw: RawRun) -> Result<RolloutRun, SqliteStoreError> {
    Ok(RolloutRun {
        run_id: RunId::new(raw.run_id),
        status: parse_label(&raw.status)?,
        created_at: Timestamp::from_unix_millis(raw.created_at),
        updated_at: Timestamp::from_unix_millis(raw.updated_at),
        initiated_by: raw.initiated_by,
        dry_run: raw.dry_run,
        failure_threshold: parse_threshold(raw.failure_threshold)?,
    })
}

/// Decodes a stage row.
fn decode_stage(raw: RawStage) -> Result<RolloutStage, SqliteStoreError> {
    let target_selector: TargetSelector = serde_json::from_str(&raw.target_selector_json)
        .map_err(|err| SqliteStoreError::Corrupt(format!("stage {}: {err}", raw.stage_id)))?;
    Ok(RolloutStage {
        stage_id: StageId::new(raw.stage_id),
        run_id: RunId::new(raw.run_id),
        sequencing: raw.sequencing,
        name: raw.name,
        target_selector,
        failure_threshold: raw.failure_threshold.map(parse_threshold).transpose()?,
    })
}

/// Decodes a target row.
fn decode_target(raw: RawTarget) -> Result<RolloutTarget, SqliteStoreError> {
    let attempt_count = u32::try_from(raw.attempt_count).map_err(|_| {
        SqliteStoreError::Corrupt(format!("attempt count out of range for {}", raw.target_id))
    })?;
    Ok(RolloutTarget {
        state: parse_label(&raw.state)?,
        planned_hash: parse_digest(&raw.planned_hash)?,
        policy_hash: raw.policy_hash.as_deref().map(parse_digest).transpose()?,
        target_id: TargetId::new(raw.target_id),
        stage_id: StageId::new(raw.stage_id),
        run_id: RunId::new(raw.run_id),
        hostname: raw.hostname,
        attempt_count,
        last_error: raw.last_error,
        updated_at: Timestamp::from_unix_millis(raw.updated_at),
    })
}

/// Decodes an event row and checks its type column against the payload.
fn decode_event(raw: RawEvent) -> Result<RolloutEvent, SqliteStoreError> {
    let event_id = u64::try_from(raw.event_id)
        .ok()
        .and_then(EventId::from_raw)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("invalid event id {}", raw.event_id)))?;
    let payload: EventPayload = serde_json::from_str(&raw.payload_json)
        .map_err(|err| SqliteStoreError::Corrupt(format!("event {event_id}: {err}")))?;
    if payload.event_type().as_str() != raw.event_type {
        return Err(SqliteStoreError::Corrupt(format!(
            "event {event_id}: type column {} does not match payload",
            raw.event_type
        )));
    }
    Ok(RolloutEvent {
        event_id,
        run_id: RunId::new(raw.run_id),
        stage_id: raw.stage_id.map(StageId::new),
        target_id: raw.target_id.map(TargetId::new),
        timestamp: Timestamp::from_unix_millis(raw.timestamp),
        payload,
    })
}

/// Parses a stored status or state label.
fn parse_label<T: std::str::FromStr>(raw: &str) -> Result<T, SqliteStoreError> {
    raw.parse().map_err(|_| SqliteStoreError::Corrupt(format!("unknown label: {raw}")))
}

/// Parses a stored digest.
fn parse_digest(raw: &str) -> Result<HashDigest, SqliteStoreError> {
    raw.parse().map_err(|err| SqliteStoreError::Corrupt(format!("{err}")))
}

/// Parses a stored threshold.
fn parse_threshold(raw: f64) -> Result<FailureThreshold, SqliteStoreError> {
    FailureThreshold::new(raw)
        .ok_or_else(|| SqliteStoreError::Corrupt(format!("failure threshold out of range: {raw}")))
}

/// Runs a trivial query to prove the connection is usable.
fn check_connection(connection: &Connection) -> Result<(), SqliteStoreError> {
    connection.query_row("SELECT 1", params![], |row| row.get::<_, i64>(0)).map_err(db_error)?;
    Ok(())
}

/// Converts a result limit to an `SQLite` integer.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::Invalid("store path must not be empty".to_string()));
    }
    if path.display().to_string().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    if path
        .components()
        .any(|component| component.as_os_str().to_string_lossy().len() > MAX_PATH_COMPONENT_LENGTH)
    {
        return Err(SqliteStoreError::Invalid(
            "store path contains an overlong component".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with durability pragmas applied.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(db_error)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_error)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(db_error)?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(db_error)?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms)).map_err(db_error)?;
    Ok(connection)
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_error)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db_error)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(db_error)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(db_error)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    initiated_by TEXT NOT NULL,
                    dry_run INTEGER NOT NULL,
                    failure_threshold REAL NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status, created_at);
                CREATE TABLE IF NOT EXISTS stages (
                    stage_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    sequencing INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    target_selector_json TEXT NOT NULL,
                    failure_threshold REAL,
                    UNIQUE (run_id, sequencing)
                );
                CREATE TABLE IF NOT EXISTS targets (
                    target_id TEXT PRIMARY KEY,
                    stage_id TEXT NOT NULL REFERENCES stages(stage_id) ON DELETE CASCADE,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    hostname TEXT NOT NULL,
                    state TEXT NOT NULL,
                    planned_hash TEXT NOT NULL,
                    policy_hash TEXT,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    updated_at INTEGER NOT NULL,
                    artifact_content TEXT NOT NULL,
                    artifact_hash TEXT NOT NULL,
                    CHECK ((state = 'completed') = (policy_hash IS NOT NULL))
                );
                CREATE INDEX IF NOT EXISTS idx_targets_stage ON targets (stage_id, position);
                CREATE INDEX IF NOT EXISTS idx_targets_run_state ON targets (run_id, state);
                CREATE TABLE IF NOT EXISTS events (
                    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    stage_id TEXT,
                    target_id TEXT,
                    event_type TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    payload_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id, event_id);",
            )
            .map_err(db_error)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(db_error)?;
    Ok(())
}
