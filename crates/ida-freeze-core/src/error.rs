//! Error taxonomy of the workflow.

use ida_freeze_config::StoreError;

use crate::files::FileError;

#[derive(Debug, thiserror::Error)]
pub enum FreezeError {
    /// An unresolved action already covers an overlapping scope.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Project suspended. Action not permitted.")]
    Suspended(String),

    #[error("Service temporarily unavailable. Please try again later.")]
    ServiceOffline,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Empty scope: {0}")]
    EmptyScope(String),

    #[error("Maximum allowed file count exceeded: {count} files, limit {limit}")]
    TooManyFiles { count: usize, limit: usize },

    #[error("Transient file error: {0}")]
    TransientFile(String),

    #[error("Permanent file error: {0}")]
    PermanentFile(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Action {pid} is leased by {owner}")]
    LeaseConflict { pid: String, owner: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FreezeError>;

impl From<StoreError> for FreezeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ScopeConflict { pid, scope, .. } => FreezeError::Conflict(format!(
                "scope {scope} overlaps unresolved action {pid}"
            )),
            StoreError::LeaseConflict { pid, owner } => FreezeError::LeaseConflict { pid, owner },
            StoreError::NotFound(what) => FreezeError::NotFound(what),
            StoreError::InvalidState(message) => FreezeError::InvalidRequest(message),
            other => FreezeError::Store(other),
        }
    }
}

impl From<FileError> for FreezeError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(path) => FreezeError::NotFound(path),
            FileError::Transient(message) => FreezeError::TransientFile(message),
            FileError::Permanent(message) => FreezeError::PermanentFile(message),
        }
    }
}

impl FreezeError {
    /// Short machine readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            FreezeError::Conflict(_) => "conflict",
            FreezeError::Suspended(_) => "suspended",
            FreezeError::ServiceOffline => "service_offline",
            FreezeError::Forbidden(_) => "forbidden",
            FreezeError::EmptyScope(_) => "empty_scope",
            FreezeError::TooManyFiles { .. } => "too_many_files",
            FreezeError::TransientFile(_) => "transient_file",
            FreezeError::PermanentFile(_) => "permanent_file",
            FreezeError::Timeout(_) => "timeout",
            FreezeError::LeaseConflict { .. } => "lease_conflict",
            FreezeError::NotFound(_) => "not_found",
            FreezeError::InvalidRequest(_) => "invalid_request",
            FreezeError::Store(_) => "store",
            FreezeError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let conflict: FreezeError = StoreError::ScopeConflict {
            project: "p".into(),
            scope: "/data".into(),
            pid: "a1".into(),
        }
        .into();
        assert_eq!(conflict.kind(), "conflict");
        assert!(conflict.to_string().contains("a1"));

        let lease: FreezeError = StoreError::LeaseConflict {
            pid: "a1".into(),
            owner: "w2".into(),
        }
        .into();
        assert!(matches!(lease, FreezeError::LeaseConflict { .. }));

        let version: FreezeError = StoreError::VersionConflict("a1".into()).into();
        assert_eq!(version.kind(), "store");
    }

    #[test]
    fn test_file_errors_map_to_taxonomy() {
        let err: FreezeError = FileError::Transient("busy".into()).into();
        assert_eq!(err.kind(), "transient_file");
        let err: FreezeError = FileError::Permanent("bad".into()).into();
        assert_eq!(err.kind(), "permanent_file");
    }

    #[test]
    fn test_suspended_message() {
        let err = FreezeError::Suspended("p".into());
        assert_eq!(err.to_string(), "Project suspended. Action not permitted.");
    }
}
