use std::collections::{BTreeMap, HashSet};

use ida_freeze_config::{now_utc, ActionKind, ActionRecord, FrozenFileRecord};
use tracing::{debug, info, warn};

use super::{ActionEngine, BATCH_METADATA_KEY};
use crate::error::{FreezeError, Result};
use crate::files::{Area, FileEntry};

const MAX_REPORTED_CONFLICTS: usize = 10;

/// True if `record` is a terminal outcome of an action of kind `kind`.
pub(super) fn is_terminal_record(kind: ActionKind, record: &FrozenFileRecord, replicate: bool) -> bool {
    match kind {
        ActionKind::Freeze => {
            record.removed.is_none()
                && record.frozen.is_some()
                && (record.replicated.is_some() || !replicate)
        }
        ActionKind::Unfreeze | ActionKind::Delete => record.removed.is_some(),
    }
}

impl ActionEngine {
    /// Enumerate the files of a claimed action and record the file count.
    /// An already enumerated action is returned unchanged.
    pub(super) async fn scan_claimed(&self, action: ActionRecord) -> Result<ActionRecord> {
        if action.filecount.is_some() {
            return Ok(action);
        }
        let pid = action.pid.clone();
        let files = self
            .lister
            .list_files(
                &action.project,
                Area::source_of(action.action),
                &action.pathname,
            )
            .await?;
        debug!(pid = %pid, count = files.len(), "Enumerated files");

        if files.is_empty() {
            let message = format!("No files found in {}", action.pathname);
            self.update_action(&pid, |a| {
                if !a.is_in_flight() {
                    return Ok(false);
                }
                let now = now_utc();
                a.filecount = Some(0);
                a.failed = Some(now);
                a.error = Some(message.clone());
                a.lease = None;
                a.heartbeat = Some(now);
                Ok(true)
            })?;
            warn!(pid = %pid, pathname = %action.pathname, "Action has no files");
            return Err(FreezeError::EmptyScope(action.pathname));
        }

        let batch = action
            .metadata
            .get(BATCH_METADATA_KEY)
            .is_some_and(|v| v == "true");
        let limit = self.settings.max_file_count;
        if files.len() > limit && !batch {
            self.discard(&pid);
            return Err(FreezeError::TooManyFiles {
                count: files.len(),
                limit,
            });
        }

        if action.action == ActionKind::Freeze {
            let frozen: HashSet<String> = self
                .stores
                .files
                .find_frozen(&action.project, Some(&action.pathname))?
                .into_iter()
                .map(|r| r.pathname)
                .collect();
            let clashes: Vec<&str> = files
                .iter()
                .filter(|f| frozen.contains(&f.pathname))
                .map(|f| f.pathname.as_str())
                .collect();
            if !clashes.is_empty() {
                self.discard(&pid);
                let listed: Vec<&str> = clashes.iter().take(MAX_REPORTED_CONFLICTS).copied().collect();
                return Err(FreezeError::Conflict(format!(
                    "{} files are already frozen: {}",
                    clashes.len(),
                    listed.join(", ")
                )));
            }
        }

        let count = files.len() as u64;
        let action = self.update_action(&pid, |a| {
            if a.filecount.is_some() {
                return Ok(false);
            }
            a.filecount = Some(count);
            a.heartbeat = Some(now_utc());
            Ok(true)
        })?;
        info!(pid = %pid, filecount = count, "Scanned action");
        Ok(action)
    }

    /// Files of the action without a terminal outcome, ordered by pathname.
    ///
    /// The enumeration is the union, by node, of the source listing, the
    /// action's own records and files that an interrupted run may already have
    /// moved out of the source area.
    pub(super) async fn pending_files(&self, action: &ActionRecord) -> Result<Vec<FileEntry>> {
        let replicate = self.storage.replication_backend().is_some();
        let own = self.stores.files.find_action_files(&action.pid)?;
        let mut by_node: BTreeMap<i64, FileEntry> = BTreeMap::new();

        let source = Area::source_of(action.action);
        for entry in self
            .lister
            .list_files(&action.project, source, &action.pathname)
            .await?
        {
            by_node.entry(entry.node).or_insert(entry);
        }
        for record in &own {
            by_node
                .entry(record.node)
                .or_insert_with(|| FileEntry::from(record));
        }

        let frozen = self
            .stores
            .files
            .find_frozen(&action.project, Some(&action.pathname))?;
        match action.action {
            ActionKind::Freeze => {
                let frozen_nodes: HashSet<i64> = frozen.iter().map(|r| r.node).collect();
                for entry in self
                    .lister
                    .list_files(&action.project, Area::Frozen, &action.pathname)
                    .await?
                {
                    if !frozen_nodes.contains(&entry.node) {
                        by_node.entry(entry.node).or_insert(entry);
                    }
                }
            }
            ActionKind::Unfreeze | ActionKind::Delete => {
                for record in &frozen {
                    by_node
                        .entry(record.node)
                        .or_insert_with(|| FileEntry::from(record));
                }
            }
        }

        let terminal: HashSet<i64> = own
            .iter()
            .filter(|r| is_terminal_record(action.action, r, replicate))
            .map(|r| r.node)
            .chain(action.progress.failures.iter().map(|f| f.node))
            .collect();

        let mut pending: Vec<FileEntry> = by_node
            .into_values()
            .filter(|entry| !terminal.contains(&entry.node))
            .collect();
        pending.sort_by(|a, b| a.pathname.cmp(&b.pathname));
        Ok(pending)
    }

    /// Drop an action rejected during enumeration.
    fn discard(&self, pid: &str) {
        match self.stores.actions.delete_action(pid) {
            Ok(()) => debug!(pid, "Discarded action"),
            Err(e) => warn!(pid, "Failed to discard action: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_record_rules() {
        let now = now_utc();
        let mut record = FrozenFileRecord::new(1, "a1", "p1", "/a", "f1", 1);
        assert!(!is_terminal_record(ActionKind::Freeze, &record, true));

        record.frozen = Some(now);
        assert!(is_terminal_record(ActionKind::Freeze, &record, false));
        assert!(!is_terminal_record(ActionKind::Freeze, &record, true));

        record.replicated = Some(now);
        assert!(is_terminal_record(ActionKind::Freeze, &record, true));
        assert!(!is_terminal_record(ActionKind::Unfreeze, &record, true));

        record.removed = Some(now);
        assert!(is_terminal_record(ActionKind::Delete, &record, true));
        assert!(!is_terminal_record(ActionKind::Freeze, &record, true));
    }
}
