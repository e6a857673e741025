use std::sync::atomic::{AtomicU8, Ordering};

use futures::stream::{self, StreamExt};
use ida_freeze_config::{
    now_utc, ActionKind, ActionRecord, FileCommit, FileFailure, FileWrite, FrozenFileRecord,
    StoreError,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ActionEngine, Stop};
use crate::error::{FreezeError, Result};
use crate::files::{normalize_checksum, Area, FileEntry, FileError};
use crate::pid::{self, PidKind};

const MAX_COMMIT_ATTEMPTS: usize = 3;

/// First stop condition raised by any file of a run.
#[derive(Debug, Default)]
pub(super) struct StopSignal(AtomicU8);

impl StopSignal {
    fn raise(&self, stop: Stop) {
        let code = match stop {
            Stop::Suspended => 1,
            Stop::Cancelled => 2,
            Stop::LeaseLost => 3,
        };
        let _ = self
            .0
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn get(&self) -> Option<Stop> {
        match self.0.load(Ordering::SeqCst) {
            1 => Some(Stop::Suspended),
            2 => Some(Stop::Cancelled),
            3 => Some(Stop::LeaseLost),
            _ => None,
        }
    }
}

/// Text recorded for a file that failed for good.
fn failure_text(err: &FreezeError) -> String {
    match err {
        FreezeError::TransientFile(msg)
        | FreezeError::PermanentFile(msg)
        | FreezeError::Timeout(msg) => msg.clone(),
        FreezeError::NotFound(path) => format!("File not found: {path}"),
        other => other.to_string(),
    }
}

impl ActionEngine {
    /// Process `pending` files with bounded concurrency, in pathname order.
    /// Returns the stop condition that ended the pass early, if any.
    pub(super) async fn process_pending(
        &self,
        action: &ActionRecord,
        pending: Vec<FileEntry>,
    ) -> Result<Option<Stop>> {
        let stop = StopSignal::default();
        let results: Vec<Result<()>> = stream::iter(pending)
            .map(|entry| self.handle_file(action, entry, &stop))
            .buffer_unordered(self.settings.max_concurrent_files)
            .collect()
            .await;
        for result in results {
            result?;
        }
        Ok(stop.get())
    }

    async fn handle_file(
        &self,
        action: &ActionRecord,
        entry: FileEntry,
        stop: &StopSignal,
    ) -> Result<()> {
        if stop.get().is_some() {
            return Ok(());
        }
        if self.suspension.is_suspended(&action.project) {
            stop.raise(Stop::Suspended);
            return Ok(());
        }
        if self.cancel_pending(&action.pid) {
            stop.raise(Stop::Cancelled);
            return Ok(());
        }

        let write = self.process_with_retry(action, &entry).await?;
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let now = now_utc();
            let commit = FileCommit {
                action: action.pid.clone(),
                owner: self.worker_id.clone(),
                at: now,
                lease_expires: now + self.settings.lease_ttl,
                write: write.clone(),
            };
            match self.stores.actions.commit_file(&commit) {
                Ok(updated) => {
                    if updated.cancel_requested.is_some() {
                        stop.raise(Stop::Cancelled);
                    }
                    return Ok(());
                }
                Err(StoreError::VersionConflict(_)) => continue,
                Err(e @ StoreError::LeaseConflict { .. }) | Err(e @ StoreError::InvalidState(_)) => {
                    warn!(pid = %action.pid, pathname = %entry.pathname, "Commit rejected: {}", e);
                    stop.raise(Stop::LeaseLost);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FreezeError::Store(StoreError::VersionConflict(action.pid.clone())))
    }

    /// Process one file, retrying transient errors. All attempts and the
    /// backoff between them share one `file_timeout` budget, which keeps a
    /// single file well inside the lease. Per-file errors become a
    /// [`FileWrite::Failed`]; only infrastructure errors are returned.
    async fn process_with_retry(&self, action: &ActionRecord, entry: &FileEntry) -> Result<FileWrite> {
        let policy = self.settings.retry;
        let timeout = self.settings.file_timeout;
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout_at(deadline, self.process_file(action, entry)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FreezeError::Timeout(format!(
                    "Timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            let error = match outcome {
                Ok(write) => return Ok(write),
                Err(FreezeError::TransientFile(msg)) if policy.should_retry(attempt) => {
                    let delay = policy.backoff(attempt);
                    if Instant::now() + delay >= deadline {
                        FreezeError::TransientFile(msg)
                    } else if !self.renew_lease(&action.pid)? {
                        // The commit of this outcome is rejected and stops the run.
                        FreezeError::TransientFile(msg)
                    } else {
                        debug!(
                            pid = %action.pid,
                            pathname = %entry.pathname,
                            attempt,
                            "Transient file error, retrying: {}",
                            msg
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
                Err(
                    e @ (FreezeError::TransientFile(_)
                    | FreezeError::PermanentFile(_)
                    | FreezeError::NotFound(_)
                    | FreezeError::Timeout(_)),
                ) => e,
                Err(e) => return Err(e),
            };

            warn!(
                pid = %action.pid,
                pathname = %entry.pathname,
                attempts = attempt,
                "File failed: {}",
                error
            );
            return Ok(FileWrite::Failed(FileFailure {
                node: entry.node,
                pathname: entry.pathname.clone(),
                error: failure_text(&error),
                attempts: attempt,
                at: now_utc(),
            }));
        }
    }

    async fn process_file(&self, action: &ActionRecord, entry: &FileEntry) -> Result<FileWrite> {
        match action.action {
            ActionKind::Freeze => self.freeze_file(action, entry).await,
            ActionKind::Unfreeze | ActionKind::Delete => self.remove_file(action, entry).await,
        }
    }

    async fn freeze_file(&self, action: &ActionRecord, entry: &FileEntry) -> Result<FileWrite> {
        let project = &action.project;
        let pathname = &entry.pathname;
        let replicate = self.storage.replication_backend().is_some();
        let existing = self
            .stores
            .files
            .find_by_action_node(&action.pid, entry.node)?;

        let mut record = match existing {
            Some(record) if record.frozen.is_some() => record,
            existing => {
                let digest = match self.storage.digest(project, Area::Staging, pathname).await {
                    // Moved by an interrupted attempt.
                    Err(FileError::NotFound(_)) => {
                        self.storage.digest(project, Area::Frozen, pathname).await?
                    }
                    other => other?,
                };
                if digest.size != entry.size {
                    return Err(FreezeError::PermanentFile(format!(
                        "File size on disk ({}) does not match the originally reported upload file size ({})",
                        digest.size, entry.size
                    )));
                }
                if let Some(expected) = &entry.checksum {
                    let expected = normalize_checksum(expected);
                    if expected != digest.checksum {
                        return Err(FreezeError::PermanentFile(format!(
                            "Checksum mismatch: expected {expected}, found {}",
                            digest.checksum
                        )));
                    }
                }

                self.storage.freeze(project, pathname).await?;

                let mut record = existing.unwrap_or_else(|| {
                    FrozenFileRecord::new(
                        entry.node,
                        &action.pid,
                        project,
                        pathname,
                        pid::generate(PidKind::File, entry.node),
                        digest.size,
                    )
                });
                record.size = digest.size;
                record.checksum = Some(digest.checksum);
                record.modified = entry.modified;
                record.frozen = Some(now_utc());
                if replicate && record.id == 0 {
                    // Frozen but not yet replicated.
                    record = self.stores.files.insert_file(&record)?;
                }
                record
            }
        };

        if replicate && record.replicated.is_none() {
            self.storage.replicate(project, pathname).await?;
            record.replicated = Some(now_utc());
        }
        debug!(pid = %action.pid, pathname = %pathname, "Froze file");
        Ok(FileWrite::Frozen(record))
    }

    async fn remove_file(&self, action: &ActionRecord, entry: &FileEntry) -> Result<FileWrite> {
        let project = &action.project;
        let pathname = &entry.pathname;

        if let Some(own) = self
            .stores
            .files
            .find_by_action_node(&action.pid, entry.node)?
        {
            if own.removed.is_some() {
                return Ok(FileWrite::Removed {
                    original: None,
                    clone: own,
                });
            }
        }

        let current = self.stores.files.find_current_by_node(entry.node)?;
        if current.is_none() {
            info!(pid = %action.pid, pathname = %pathname, "No frozen file record for node {}", entry.node);
        }

        match action.action {
            ActionKind::Unfreeze => self.storage.unfreeze(project, pathname).await?,
            _ => self.storage.delete(project, pathname).await?,
        }
        self.storage.remove_replica(project, pathname).await?;

        let now = now_utc();
        let clone = match &current {
            Some(original) => FrozenFileRecord {
                id: 0,
                action: action.pid.clone(),
                removed: Some(now),
                cleared: None,
                ..original.clone()
            },
            None => {
                let mut record = FrozenFileRecord::new(
                    entry.node,
                    &action.pid,
                    project,
                    pathname,
                    pid::generate(PidKind::File, entry.node),
                    entry.size,
                );
                record.checksum = entry.checksum.as_deref().map(normalize_checksum);
                record.modified = entry.modified;
                record.removed = Some(now);
                record
            }
        };
        debug!(pid = %action.pid, pathname = %pathname, action = %action.action, "Removed file");
        Ok(FileWrite::Removed {
            original: current.map(|c| c.id),
            clone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_stop_wins() {
        let stop = StopSignal::default();
        assert_eq!(stop.get(), None);
        stop.raise(Stop::Suspended);
        stop.raise(Stop::Cancelled);
        assert_eq!(stop.get(), Some(Stop::Suspended));
    }

    #[test]
    fn test_failure_text() {
        assert_eq!(
            failure_text(&FreezeError::PermanentFile("bad".into())),
            "bad"
        );
        assert_eq!(
            failure_text(&FreezeError::NotFound("/a".into())),
            "File not found: /a"
        );
    }
}
