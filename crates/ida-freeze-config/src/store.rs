//! Store traits required by the workflow engine.
//!
//! The traits abstract the three durable tables so the engine can be wired to
//! any backend. Methods that must be atomic across rows (exclusive insert,
//! retry hand-over, per-file commit) are single trait methods so an
//! implementation can run them in one transaction.

use chrono::{DateTime, Utc};

use crate::types::{
    ActionRecord, ActionStatus, ChangeKind, ChangeMode, DataChangeRecord, FileFailure,
    FrozenFileRecord, ParseKindError,
};

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("scope {scope} of project {project} overlaps unresolved action {pid}")]
    ScopeConflict {
        project: String,
        scope: String,
        pid: String,
    },

    #[error("action {0} was modified concurrently")]
    VersionConflict(String),

    #[error("action {pid} is leased by {owner}")]
    LeaseConflict { pid: String, owner: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] ParseKindError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Terminal per-file write committed together with the action checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum FileWrite {
    /// The file is frozen (and replicated, when replication is enabled).
    /// A record with `id == 0` is inserted, otherwise updated.
    Frozen(FrozenFileRecord),
    /// The file was unfrozen or deleted. `original` is the id of the record
    /// being superseded, if one was found; `clone` is the record owned by the
    /// removing action, with `removed` set.
    Removed {
        original: Option<i64>,
        clone: FrozenFileRecord,
    },
    /// The file failed permanently; no file record is written.
    Failed(FileFailure),
}

impl FileWrite {
    pub fn node(&self) -> i64 {
        match self {
            Self::Frozen(record) => record.node,
            Self::Removed { clone, .. } => clone.node,
            Self::Failed(failure) => failure.node,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// A per-file outcome plus the checkpoint it advances.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCommit {
    pub action: String,
    /// Worker that must currently hold the lease.
    pub owner: String,
    pub at: DateTime<Utc>,
    /// New lease expiry; committing renews the lease.
    pub lease_expires: DateTime<Utc>,
    pub write: FileWrite,
}

/// Durable table of action records.
pub trait ActionStore: Send + Sync {
    /// Insert `action` unless an unresolved action of the same project has an
    /// intersecting scope, in which case [`StoreError::ScopeConflict`] names it.
    fn insert_exclusive(&self, action: &ActionRecord) -> StoreResult<ActionRecord>;

    fn get_action(&self, pid: &str) -> StoreResult<Option<ActionRecord>>;

    /// Write every mutable field if the stored version still equals
    /// `action.version`. Returns the record carrying its new version.
    fn update_action(&self, action: &ActionRecord) -> StoreResult<ActionRecord>;

    /// Remove an action that never got past enumeration.
    fn delete_action(&self, pid: &str) -> StoreResult<()>;

    /// Most recent first. An empty `projects` slice means all projects.
    fn find_actions(
        &self,
        status: Option<ActionStatus>,
        projects: &[String],
    ) -> StoreResult<Vec<ActionRecord>>;

    fn count_actions(&self, status: Option<ActionStatus>, projects: &[String]) -> StoreResult<u64>;

    /// Unresolved actions of `project` whose scope intersects `pathname`.
    fn find_conflicting(&self, project: &str, pathname: &str) -> StoreResult<Vec<ActionRecord>>;

    /// In-flight actions whose last checkpoint (or initiation) is before `before`.
    fn find_stale(&self, before: DateTime<Utc>) -> StoreResult<Vec<ActionRecord>>;

    /// Atomically hand a failed action over to its successor: insert `retry`,
    /// mark `failed` as cleared and retried, and move the file records of
    /// `failed` to `retry`. Returns the stored (failed, retry) pair.
    fn begin_retry(
        &self,
        failed: &ActionRecord,
        retry: &ActionRecord,
    ) -> StoreResult<(ActionRecord, ActionRecord)>;

    /// Atomically write a terminal per-file outcome and advance the action's
    /// checkpoint. Replaying an outcome that is already recorded leaves the
    /// checkpoint untouched.
    fn commit_file(&self, commit: &FileCommit) -> StoreResult<ActionRecord>;
}

/// Durable table of frozen file provenance records.
pub trait FrozenFileStore: Send + Sync {
    /// Insert a record and return it with its assigned id.
    fn insert_file(&self, file: &FrozenFileRecord) -> StoreResult<FrozenFileRecord>;

    fn update_file(&self, file: &FrozenFileRecord) -> StoreResult<()>;

    /// Most recent record carrying `pid`.
    fn find_file_by_pid(&self, pid: &str) -> StoreResult<Option<FrozenFileRecord>>;

    fn find_by_action_node(&self, action: &str, node: i64)
        -> StoreResult<Option<FrozenFileRecord>>;

    /// The record through which `node` is currently frozen, if any.
    fn find_current_by_node(&self, node: i64) -> StoreResult<Option<FrozenFileRecord>>;

    /// Records owned by an action, ordered by pathname.
    fn find_action_files(&self, action: &str) -> StoreResult<Vec<FrozenFileRecord>>;

    /// Currently frozen records of a project, optionally limited to a scope,
    /// ordered by pathname.
    fn find_frozen(&self, project: &str, scope: Option<&str>)
        -> StoreResult<Vec<FrozenFileRecord>>;

    /// Pids of currently frozen files of a project.
    fn frozen_pids(&self, project: &str) -> StoreResult<Vec<String>>;

    /// Logically purge records: removed before `removed_before`, or never
    /// removed, frozen before `orphaned_before` and owned by no existing action.
    fn clear_expired(
        &self,
        removed_before: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Filter for data change queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChangeQuery {
    pub project: String,
    pub user: Option<String>,
    pub change: Option<ChangeKind>,
    pub mode: Option<ChangeMode>,
    pub pathname: Option<String>,
    /// Only changes strictly after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only changes appended after this sequence number. Orders results by
    /// sequence instead of timestamp.
    pub after: Option<i64>,
    pub limit: Option<usize>,
    /// Oldest first when true, most recent first otherwise.
    pub ascending: bool,
}

impl DataChangeQuery {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_change(mut self, change: ChangeKind) -> Self {
        self.change = Some(change);
        self
    }

    pub fn with_mode(mut self, mode: ChangeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn after(mut self, seq: i64) -> Self {
        self.after = Some(seq);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ascending(mut self) -> Self {
        self.ascending = true;
        self
    }
}

/// Append-only journal of project level changes.
pub trait DataChangeStore: Send + Sync {
    /// Append a change and return it with its sequence number.
    fn append_change(&self, change: &DataChangeRecord) -> StoreResult<DataChangeRecord>;

    fn query_changes(&self, query: &DataChangeQuery) -> StoreResult<Vec<DataChangeRecord>>;
}
