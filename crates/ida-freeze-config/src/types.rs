//! Record types shared by the stores, the engine and the API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Suffix distinguishing a project's staging root from its frozen root.
pub const STAGING_FOLDER_SUFFIX: &str = "+";

/// Prefix of a project's designated service identity.
pub const PROJECT_USER_PREFIX: &str = "PSO_";

/// User recorded for actions and changes made by administrators or service identities.
pub const SERVICE_USER: &str = "service";

/// Initialization timestamp reported for projects that predate the change log.
pub const MIGRATION_TIMESTAMP: &str = "2018-11-01T00:00:00Z";

pub const DEFAULT_MAX_FILE_COUNT: usize = 5000;

/// Service identity of a project.
pub fn project_user(project: &str) -> String {
    format!("{PROJECT_USER_PREFIX}{project}")
}

/// True if `user` is the designated service identity of `project`.
pub fn is_project_user(user: &str, project: &str) -> bool {
    user.strip_prefix(PROJECT_USER_PREFIX) == Some(project)
}

/// Current time truncated to the precision stored in the database.
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// Fixed width UTC representation; lexical order equals chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Error for unrecognised enum values coming from storage or requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseKindError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseKindError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Kind of bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Freeze,
    Unfreeze,
    Delete,
}

string_enum!(ActionKind, "action", {
    Freeze => "freeze",
    Unfreeze => "unfreeze",
    Delete => "delete",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Folder,
}

string_enum!(NodeType, "node type", {
    File => "file",
    Folder => "folder",
});

/// Lifecycle state of an action, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Initiated,
    Scanning,
    Processing,
    Completed,
    Failed,
    Cleared,
}

string_enum!(ActionState, "action state", {
    Initiated => "initiated",
    Scanning => "scanning",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cleared => "cleared",
});

/// Status filter for action queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Neither completed, failed nor cleared.
    Pending,
    /// Completed and not cleared.
    Completed,
    /// Failed and not cleared.
    Failed,
    Cleared,
    /// Not completed and not cleared. This is the set that blocks overlapping scopes.
    Incomplete,
    /// Not cleared and not yet enumerated.
    Initiating,
}

string_enum!(ActionStatus, "action status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Cleared => "cleared",
    Incomplete => "incomplete",
    Initiating => "initiating",
});

/// Checksum of one frozen file, as listed on a completed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    pub pid: String,
    pub pathname: String,
    pub checksum: String,
}

/// Replication summary of an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Backend identifier, `None` when replication is disabled.
    pub backend: Option<String>,
    /// Number of files copied to the replication tier.
    pub replicated: u64,
    /// Time the last file of the action was replicated.
    pub completed: Option<DateTime<Utc>>,
}

/// Permanent per-file failure recorded against an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub node: i64,
    pub pathname: String,
    pub error: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Durable checkpoint of an action's per-file processing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionProgress {
    /// Files with a terminal outcome, successes and failures alike.
    pub processed: u64,
    pub succeeded: u64,
    pub failures: Vec<FileFailure>,
    /// Set while the action is parked by a suspension. Cleared on the next claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<DateTime<Utc>>,
}

impl ActionProgress {
    pub fn has_failure(&self, node: i64) -> bool {
        self.failures.iter().any(|f| f.node == node)
    }
}

/// Exclusive claim of a worker on an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub acquired: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// One bulk freeze, unfreeze or delete operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub pid: String,
    pub action: ActionKind,
    pub project: String,
    pub user: String,
    pub pathname: String,
    pub node: i64,
    pub nodetype: Option<NodeType>,
    pub filecount: Option<u64>,
    pub initiated: DateTime<Utc>,
    pub storage: Option<String>,
    pub pids: Vec<String>,
    pub checksums: Vec<ChecksumEntry>,
    pub metadata: BTreeMap<String, String>,
    pub replication: ReplicationStatus,
    pub progress: ActionProgress,
    pub completed: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub cleared: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Pid of the action that took over after this one failed.
    pub retry: Option<String>,
    /// Pid of the failed action this one took over from.
    pub retrying: Option<String>,
    pub cancel_requested: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    /// Time of the last durable checkpoint.
    pub heartbeat: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by every update.
    pub version: i64,
}

impl ActionRecord {
    pub fn new(
        pid: impl Into<String>,
        action: ActionKind,
        project: impl Into<String>,
        user: impl Into<String>,
        pathname: impl Into<String>,
        initiated: DateTime<Utc>,
    ) -> Self {
        Self {
            pid: pid.into(),
            action,
            project: project.into(),
            user: user.into(),
            pathname: pathname.into(),
            node: 0,
            nodetype: None,
            filecount: None,
            initiated,
            storage: None,
            pids: Vec::new(),
            checksums: Vec::new(),
            metadata: BTreeMap::new(),
            replication: ReplicationStatus::default(),
            progress: ActionProgress::default(),
            completed: None,
            failed: None,
            cleared: None,
            error: None,
            retry: None,
            retrying: None,
            cancel_requested: None,
            lease: None,
            heartbeat: None,
            version: 0,
        }
    }

    pub fn with_node(mut self, node: i64) -> Self {
        self.node = node;
        self
    }

    pub fn with_storage(mut self, storage: Option<String>) -> Self {
        self.storage = storage;
        self
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.completed.is_some() || self.failed.is_some()
    }

    /// Not terminal and not cleared.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() && self.cleared.is_none()
    }

    /// Blocks overlapping scopes: neither completed nor cleared.
    pub fn is_unresolved(&self) -> bool {
        self.completed.is_none() && self.cleared.is_none()
    }

    pub fn state(&self) -> ActionState {
        if self.cleared.is_some() {
            ActionState::Cleared
        } else if self.completed.is_some() {
            ActionState::Completed
        } else if self.failed.is_some() {
            ActionState::Failed
        } else if self.filecount.is_some() {
            ActionState::Processing
        } else if self.lease.is_some() {
            ActionState::Scanning
        } else {
            ActionState::Initiated
        }
    }

    /// True if `owner` may claim the action at `now`.
    pub fn lease_available_to(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match &self.lease {
            None => true,
            Some(lease) => lease.owner == owner || lease.is_expired(now),
        }
    }

    /// Time of the last sign of life: the last checkpoint, else initiation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.heartbeat.unwrap_or(self.initiated)
    }
}

/// Provenance of one file frozen by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenFileRecord {
    /// Assigned by the store on insert.
    pub id: i64,
    pub node: i64,
    pub action: String,
    pub project: String,
    pub pathname: String,
    pub pid: String,
    pub size: u64,
    /// Hex encoded SHA-256 digest, without the `sha256:` prefix.
    pub checksum: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub frozen: Option<DateTime<Utc>>,
    pub replicated: Option<DateTime<Utc>>,
    pub removed: Option<DateTime<Utc>>,
    pub cleared: Option<DateTime<Utc>>,
}

impl FrozenFileRecord {
    pub fn new(
        node: i64,
        action: impl Into<String>,
        project: impl Into<String>,
        pathname: impl Into<String>,
        pid: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: 0,
            node,
            action: action.into(),
            project: project.into(),
            pathname: pathname.into(),
            pid: pid.into(),
            size,
            checksum: None,
            modified: None,
            frozen: None,
            replicated: None,
            removed: None,
            cleared: None,
        }
    }

    /// Frozen, not removed, not cleared.
    pub fn is_currently_frozen(&self) -> bool {
        self.frozen.is_some() && self.removed.is_none() && self.cleared.is_none()
    }

    /// Checksum as a URI, the form reported to clients.
    pub fn checksum_uri(&self) -> Option<String> {
        self.checksum.as_ref().map(|c| format!("sha256:{c}"))
    }
}

/// Kind of a project level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Init,
    Add,
    Modify,
    Rename,
    Move,
    Copy,
    Delete,
}

string_enum!(ChangeKind, "change", {
    Init => "init",
    Add => "add",
    Modify => "modify",
    Rename => "rename",
    Move => "move",
    Copy => "copy",
    Delete => "delete",
});

impl ChangeKind {
    /// Rename, move and copy carry a target pathname.
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Rename | Self::Move | Self::Copy)
    }
}

/// Channel through which a change was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    System,
    #[default]
    Api,
    Cli,
    Gui,
}

string_enum!(ChangeMode, "mode", {
    System => "system",
    Api => "api",
    Cli => "cli",
    Gui => "gui",
});

/// One entry of the append-only data change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChangeRecord {
    /// Position in the journal, assigned on append. Zero for unsaved records.
    #[serde(default)]
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub user: String,
    pub change: ChangeKind,
    pub pathname: String,
    pub target: Option<String>,
    pub mode: ChangeMode,
}

impl DataChangeRecord {
    /// Synthetic initialization record for projects created before the log existed.
    pub fn migration_init(project: impl Into<String>) -> Self {
        let timestamp = parse_timestamp(MIGRATION_TIMESTAMP).unwrap_or_default();
        Self {
            seq: 0,
            timestamp,
            project: project.into(),
            user: SERVICE_USER.to_string(),
            change: ChangeKind::Init,
            pathname: "/".to_string(),
            target: None,
            mode: ChangeMode::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamp_format_is_fixed_width_and_sortable() {
        let a = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let b = a + Duration::microseconds(1);
        let (fa, fb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(fa, "2024-01-01T00:00:00.000000Z");
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fb).unwrap(), b);
    }

    #[test]
    fn test_now_round_trips_through_storage_format() {
        let now = now_utc();
        assert_eq!(parse_timestamp(&format_timestamp(&now)).unwrap(), now);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("freeze".parse::<ActionKind>().unwrap(), ActionKind::Freeze);
        assert_eq!("move".parse::<ChangeKind>().unwrap(), ChangeKind::Move);
        assert_eq!(ChangeMode::default(), ChangeMode::Api);
        let err = "thaw".parse::<ActionKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown action: thaw");
    }

    #[test]
    fn test_project_user() {
        assert_eq!(project_user("2001036"), "PSO_2001036");
        assert!(is_project_user("PSO_2001036", "2001036"));
        assert!(!is_project_user("PSO_2001036", "200103"));
        assert!(!is_project_user("alice", "2001036"));
    }

    #[test]
    fn test_action_state_derivation() {
        let now = now_utc();
        let mut action = ActionRecord::new("a1", ActionKind::Freeze, "p", "alice", "/data", now);
        assert_eq!(action.state(), ActionState::Initiated);
        assert!(action.is_in_flight());
        assert!(action.is_unresolved());

        action.lease = Some(Lease {
            owner: "w1".into(),
            acquired: now,
            expires: now + Duration::seconds(60),
        });
        assert_eq!(action.state(), ActionState::Scanning);
        assert!(action.lease_available_to("w1", now));
        assert!(!action.lease_available_to("w2", now));
        assert!(action.lease_available_to("w2", now + Duration::seconds(61)));

        action.filecount = Some(3);
        assert_eq!(action.state(), ActionState::Processing);

        action.failed = Some(now);
        assert_eq!(action.state(), ActionState::Failed);
        assert!(!action.is_in_flight());
        assert!(action.is_unresolved());

        action.cleared = Some(now);
        assert_eq!(action.state(), ActionState::Cleared);
        assert!(!action.is_unresolved());
    }

    #[test]
    fn test_frozen_file_currently_frozen() {
        let mut file = FrozenFileRecord::new(7, "a1", "p", "/data/a", "f7", 10);
        assert!(!file.is_currently_frozen());
        file.frozen = Some(now_utc());
        file.checksum = Some("abc".into());
        assert!(file.is_currently_frozen());
        assert_eq!(file.checksum_uri().as_deref(), Some("sha256:abc"));
        file.removed = Some(now_utc());
        assert!(!file.is_currently_frozen());
    }

    #[test]
    fn test_migration_init_record() {
        let record = DataChangeRecord::migration_init("p");
        assert_eq!(record.change, ChangeKind::Init);
        assert_eq!(record.user, SERVICE_USER);
        assert_eq!(record.mode, ChangeMode::System);
        assert_eq!(format_timestamp(&record.timestamp), "2018-11-01T00:00:00.000000Z");
    }
}
