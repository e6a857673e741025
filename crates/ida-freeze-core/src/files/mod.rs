//! File collaborators.
//!
//! The engine never touches files directly. [`FileLister`] enumerates the
//! files of a scope and [`FileStorage`] performs the side effects of freezing,
//! replicating, unfreezing and deleting. Every side effect is idempotent: a
//! repeated call after a partial success reports success without redoing work.

mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ida_freeze_config::{ActionKind, FrozenFileRecord, NodeType};
use serde::{Deserialize, Serialize};

pub use local::LocalFileSystem;

/// The two folder trees of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    /// Mutable staging tree, `<project>+`.
    Staging,
    /// Immutable frozen tree, `<project>`.
    Frozen,
}

impl Area {
    /// Where the files of an action are found before processing.
    pub fn source_of(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Freeze => Area::Staging,
            ActionKind::Unfreeze | ActionKind::Delete => Area::Frozen,
        }
    }
}

/// One file of a scope as reported by the lister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub node: i64,
    /// Project relative pathname, starting with `/`.
    pub pathname: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Expected SHA-256 digest reported at upload time, if known.
    pub checksum: Option<String>,
}

impl From<&FrozenFileRecord> for FileEntry {
    fn from(record: &FrozenFileRecord) -> Self {
        Self {
            node: record.node,
            pathname: record.pathname.clone(),
            size: record.size,
            modified: record.modified,
            checksum: record.checksum.clone(),
        }
    }
}

/// Size and SHA-256 digest of a file as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    /// Lower case hex, no prefix.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    /// Worth retrying: busy resources, interrupted I/O, unreachable replica.
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl FileError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FileError::Transient(_))
    }
}

/// Strip an optional `sha256:` prefix and normalise case.
pub fn normalize_checksum(checksum: &str) -> String {
    checksum
        .trim()
        .strip_prefix("sha256:")
        .unwrap_or(checksum.trim())
        .to_ascii_lowercase()
}

#[async_trait]
pub trait FileLister: Send + Sync {
    /// Files at or below `pathname` in `area`, ordered by pathname.
    /// A missing scope yields an empty list.
    async fn list_files(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Vec<FileEntry>, FileError>;

    /// Node id and type of `pathname`, `None` if it does not exist.
    async fn stat(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Option<(i64, NodeType)>, FileError>;
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn digest(&self, project: &str, area: Area, pathname: &str)
        -> Result<FileDigest, FileError>;

    /// Move a file from staging into the frozen tree.
    async fn freeze(&self, project: &str, pathname: &str) -> Result<(), FileError>;

    /// Copy a frozen file to the replication tier.
    async fn replicate(&self, project: &str, pathname: &str) -> Result<(), FileError>;

    /// Move a frozen file back to staging.
    async fn unfreeze(&self, project: &str, pathname: &str) -> Result<(), FileError>;

    /// Remove a frozen file.
    async fn delete(&self, project: &str, pathname: &str) -> Result<(), FileError>;

    /// Remove the replicated copy of a file.
    async fn remove_replica(&self, project: &str, pathname: &str) -> Result<(), FileError>;

    /// Remove folders left empty under `pathname` in `area`.
    async fn prune(&self, project: &str, area: Area, pathname: &str) -> Result<(), FileError>;

    /// Identifier of the replication tier, `None` when replication is disabled.
    fn replication_backend(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_checksum() {
        assert_eq!(normalize_checksum("sha256:ABCDEF"), "abcdef");
        assert_eq!(normalize_checksum(" abcdef "), "abcdef");
    }

    #[test]
    fn test_source_area() {
        assert_eq!(Area::source_of(ActionKind::Freeze), Area::Staging);
        assert_eq!(Area::source_of(ActionKind::Unfreeze), Area::Frozen);
        assert_eq!(Area::source_of(ActionKind::Delete), Area::Frozen);
    }
}
