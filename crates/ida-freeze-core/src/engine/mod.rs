//! Action engine.
//!
//! Drives an action through `Initiated -> Scanning -> Processing ->
//! {Completed, Failed} -> [Cleared]`. Durable state lives entirely in the
//! stores: every per-file outcome is committed together with the action
//! checkpoint, so a run can be abandoned at any point and resumed by any
//! worker holding the lease.

mod policy;
mod process;
mod scan;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use ida_freeze_config::scope::normalize_pathname;
use ida_freeze_config::{
    is_project_user, now_utc, ActionKind, ActionRecord, ActionStore, ChangeKind, ChangeMode,
    ChecksumEntry, DataChangeStore, FrozenFileRecord, FrozenFileStore, Lease, Persistence,
    ReplicationStatus, StoreError, SERVICE_USER, STAGING_FOLDER_SUFFIX,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::changes::{DataChangeLog, NewDataChange};
use crate::error::{FreezeError, Result};
use crate::files::{Area, FileLister, FileStorage};
use crate::pid::{self, PidKind};
use crate::suspension::{check_gate, check_root_mutation, SuspensionOracle};

pub use policy::{EngineSettings, RetryPolicy};

const MAX_UPDATE_ATTEMPTS: usize = 8;
const MAX_PASSES: usize = 3;
const MAX_REPORTED_FAILURES: usize = 10;
pub(crate) const BATCH_METADATA_KEY: &str = "batch";
pub const CANCELLED_ERROR: &str = "Action cancelled";

/// The three durable stores the engine writes to.
#[derive(Clone)]
pub struct Stores {
    pub actions: Arc<dyn ActionStore>,
    pub files: Arc<dyn FrozenFileStore>,
    pub changes: Arc<dyn DataChangeStore>,
}

impl Stores {
    pub fn from_persistence(persistence: Persistence) -> Self {
        let persistence = Arc::new(persistence);
        Self {
            actions: persistence.clone(),
            files: persistence.clone(),
            changes: persistence,
        }
    }
}

/// A request to freeze, unfreeze or delete a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub project: String,
    pub pathname: String,
    pub kind: ActionKind,
    pub user: String,
    /// Lift the file count limit. Only honoured for the project's service identity.
    #[serde(default)]
    pub batch: bool,
}

/// Why a run stopped without finishing the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The service or project is suspended; the lease was released.
    Suspended,
    /// Another worker took over, or the action was finalized elsewhere.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finished(ActionRecord),
    Halted {
        action: ActionRecord,
        reason: HaltReason,
    },
}

impl RunOutcome {
    pub fn action(&self) -> &ActionRecord {
        match self {
            RunOutcome::Finished(action) => action,
            RunOutcome::Halted { action, .. } => action,
        }
    }

    pub fn into_action(self) -> ActionRecord {
        match self {
            RunOutcome::Finished(action) => action,
            RunOutcome::Halted { action, .. } => action,
        }
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self {
            RunOutcome::Finished(_) => None,
            RunOutcome::Halted { reason, .. } => Some(*reason),
        }
    }
}

/// Per-run stop conditions observed at file boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    Suspended,
    Cancelled,
    LeaseLost,
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

/// Admin and the project's service identity act as the service.
fn action_user(user: &str, project: &str) -> String {
    if user == "admin" || is_project_user(user, project) {
        SERVICE_USER.to_string()
    } else {
        user.to_string()
    }
}

/// Aggregated error text of an action with per-file failures.
fn failure_summary(action: &ActionRecord) -> Option<String> {
    let failures = &action.progress.failures;
    if failures.is_empty() {
        return None;
    }
    let total = action.filecount.unwrap_or(action.progress.processed);
    let mut details: Vec<String> = failures
        .iter()
        .take(MAX_REPORTED_FAILURES)
        .map(|f| format!("{}: {}", f.pathname, f.error))
        .collect();
    if failures.len() > MAX_REPORTED_FAILURES {
        details.push(format!("and {} more", failures.len() - MAX_REPORTED_FAILURES));
    }
    Some(format!(
        "{} of {} files failed: {}",
        failures.len(),
        total,
        details.join("; ")
    ))
}

pub struct ActionEngine {
    stores: Stores,
    changes: DataChangeLog,
    lister: Arc<dyn FileLister>,
    storage: Arc<dyn FileStorage>,
    suspension: Arc<dyn SuspensionOracle>,
    settings: EngineSettings,
    worker_id: String,
    cancelled: Mutex<HashSet<String>>,
}

impl ActionEngine {
    pub fn new(
        stores: Stores,
        lister: Arc<dyn FileLister>,
        storage: Arc<dyn FileStorage>,
        suspension: Arc<dyn SuspensionOracle>,
        settings: EngineSettings,
    ) -> Self {
        let changes = DataChangeLog::new(stores.changes.clone());
        Self {
            stores,
            changes,
            lister,
            storage,
            suspension,
            settings,
            worker_id: default_worker_id(),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn changes(&self) -> &DataChangeLog {
        &self.changes
    }

    pub fn lister(&self) -> &dyn FileLister {
        self.lister.as_ref()
    }

    pub fn suspension(&self) -> &dyn SuspensionOracle {
        self.suspension.as_ref()
    }

    /// Create a new action record. Enumeration happens in [`ActionEngine::scan`].
    pub async fn start_action(&self, request: StartRequest) -> Result<ActionRecord> {
        let StartRequest {
            project,
            pathname,
            kind,
            user,
            batch,
        } = request;

        if project.trim().is_empty() {
            return Err(FreezeError::InvalidRequest("Missing project".to_string()));
        }
        let pathname = normalize_pathname(&pathname)
            .ok_or_else(|| FreezeError::InvalidRequest(format!("Invalid pathname: {pathname}")))?;

        check_gate(self.suspension.as_ref(), &project)?;
        check_root_mutation(&user, &project, &pathname)?;

        let (node, nodetype) = self
            .lister
            .stat(&project, Area::source_of(kind), &pathname)
            .await?
            .ok_or_else(|| {
                FreezeError::NotFound(format!("{pathname} in project {project}"))
            })?;

        let mut action = ActionRecord::new(
            pid::generate(PidKind::Action, node),
            kind,
            &project,
            action_user(&user, &project),
            &pathname,
            now_utc(),
        )
        .with_node(node)
        .with_storage(self.storage.replication_backend());
        action.nodetype = Some(nodetype);
        if batch && is_project_user(&user, &project) {
            action
                .metadata
                .insert(BATCH_METADATA_KEY.to_string(), "true".to_string());
        }

        let action = self.stores.actions.insert_exclusive(&action)?;
        info!(
            pid = %action.pid,
            project = %project,
            pathname = %pathname,
            action = %kind,
            user = %user,
            "Started action"
        );
        Ok(action)
    }

    /// Claim the action and enumerate its files, unless already enumerated.
    pub async fn scan(&self, pid: &str) -> Result<ActionRecord> {
        let action = self.claim(pid)?;
        self.scan_claimed(action).await
    }

    /// Process every outstanding file of an action and finalize it.
    ///
    /// Safe to call repeatedly: terminal actions are returned as they are,
    /// and files with a terminal outcome are never processed again.
    pub async fn run(&self, pid: &str) -> Result<RunOutcome> {
        let action = self.require(pid)?;
        if !action.is_in_flight() {
            return Ok(RunOutcome::Finished(action));
        }
        match check_gate(self.suspension.as_ref(), &action.project) {
            Ok(()) => {}
            Err(FreezeError::Suspended(_)) | Err(FreezeError::ServiceOffline) => {
                info!(pid, project = %action.project, "Action gated by suspension");
                let action = self.park(pid)?;
                return Ok(RunOutcome::Halted {
                    action,
                    reason: HaltReason::Suspended,
                });
            }
            Err(e) => return Err(e),
        }

        let action = self.claim(pid)?;
        let mut action = self.scan_claimed(action).await?;
        if action.cancel_requested.is_some() || self.cancel_pending(pid) {
            return self
                .finalize(pid, Some(CANCELLED_ERROR))
                .await
                .map(RunOutcome::Finished);
        }

        for pass in 1..=MAX_PASSES {
            let pending = self.pending_files(&action).await?;
            if pending.is_empty() {
                return self.finalize(pid, None).await.map(RunOutcome::Finished);
            }
            debug!(pid, pending = pending.len(), pass, "Processing files");

            match self.process_pending(&action, pending).await? {
                None => {}
                Some(Stop::Suspended) => {
                    let action = self.park(pid)?;
                    info!(pid, "Action halted by suspension");
                    return Ok(RunOutcome::Halted {
                        action,
                        reason: HaltReason::Suspended,
                    });
                }
                Some(Stop::LeaseLost) => {
                    let action = self.require(pid)?;
                    warn!(pid, "Lost lease on action");
                    return Ok(RunOutcome::Halted {
                        action,
                        reason: HaltReason::LeaseLost,
                    });
                }
                Some(Stop::Cancelled) => {
                    info!(pid, "Action cancelled");
                    return self
                        .finalize(pid, Some(CANCELLED_ERROR))
                        .await
                        .map(RunOutcome::Finished);
                }
            }
            action = self.require(pid)?;
        }

        Err(FreezeError::Internal(anyhow!(
            "action {pid} still has unprocessed files after {MAX_PASSES} passes"
        )))
    }

    /// Resume an interrupted action from its last checkpoint.
    pub async fn resume(&self, pid: &str) -> Result<RunOutcome> {
        info!(pid, worker = %self.worker_id, "Resuming action");
        self.run(pid).await
    }

    /// Hand a failed action over to a new action that redoes only the files
    /// lacking a terminal outcome.
    pub fn retry(&self, pid: &str, user: &str) -> Result<ActionRecord> {
        let failed = self.require(pid)?;
        if failed.failed.is_none() || failed.cleared.is_some() {
            return Err(FreezeError::InvalidRequest(format!(
                "Only failed, uncleared actions can be retried: {pid}"
            )));
        }
        check_gate(self.suspension.as_ref(), &failed.project)?;

        let mut next = ActionRecord::new(
            pid::generate(PidKind::Action, failed.node),
            failed.action,
            &failed.project,
            &failed.user,
            &failed.pathname,
            now_utc(),
        )
        .with_node(failed.node)
        .with_storage(failed.storage.clone());
        next.nodetype = failed.nodetype;
        next.filecount = failed.filecount;
        next.metadata = failed.metadata.clone();
        next.retrying = Some(failed.pid.clone());

        let (_, retry) = self.stores.actions.begin_retry(&failed, &next)?;
        info!(failed = %pid, retry = %retry.pid, user, "Retrying action");
        Ok(retry)
    }

    /// Fail an in-flight action with the given error text.
    pub async fn force_fail(&self, pid: &str, error: &str) -> Result<ActionRecord> {
        let action = self.require(pid)?;
        if !action.is_in_flight() {
            return Err(FreezeError::InvalidRequest(format!(
                "Action {pid} is not in progress"
            )));
        }
        warn!(pid, error, "Force failing action");
        self.finalize(pid, Some(error)).await
    }

    /// Record a cancellation request, honoured at the next file boundary.
    /// An action nobody is working on is failed right away.
    pub async fn request_cancel(&self, pid: &str) -> Result<ActionRecord> {
        let action = self.update_action(pid, |action| {
            if !action.is_in_flight() {
                return Err(FreezeError::InvalidRequest(format!(
                    "Action {pid} is not in progress"
                )));
            }
            if action.cancel_requested.is_some() {
                return Ok(false);
            }
            action.cancel_requested = Some(now_utc());
            Ok(true)
        })?;
        self.lock_cancelled().insert(pid.to_string());
        info!(pid, "Cancellation requested");

        let idle = action
            .lease
            .as_ref()
            .map_or(true, |lease| lease.is_expired(now_utc()));
        if idle {
            return self.finalize(pid, Some(CANCELLED_ERROR)).await;
        }
        Ok(action)
    }

    /// Mark a completed or failed action as cleared.
    pub fn clear(&self, pid: &str) -> Result<ActionRecord> {
        let action = self.update_action(pid, |action| {
            if action.cleared.is_some() {
                return Ok(false);
            }
            if !action.is_terminal() {
                return Err(FreezeError::InvalidRequest(format!(
                    "Action {pid} is still in progress and cannot be cleared"
                )));
            }
            action.cleared = Some(now_utc());
            action.lease = None;
            Ok(true)
        })?;
        debug!(pid, "Cleared action");
        Ok(action)
    }

    pub(crate) fn require(&self, pid: &str) -> Result<ActionRecord> {
        self.stores
            .actions
            .get_action(pid)?
            .ok_or_else(|| FreezeError::NotFound(format!("action {pid}")))
    }

    /// Read-modify-write of an action under the optimistic version check.
    /// `apply` returns false to skip the write.
    pub(crate) fn update_action<F>(&self, pid: &str, mut apply: F) -> Result<ActionRecord>
    where
        F: FnMut(&mut ActionRecord) -> Result<bool>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut action = self.require(pid)?;
            if !apply(&mut action)? {
                return Ok(action);
            }
            match self.stores.actions.update_action(&action) {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict(_)) => {
                    debug!(pid, "Concurrent update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FreezeError::Store(StoreError::VersionConflict(pid.to_string())))
    }

    fn claim(&self, pid: &str) -> Result<ActionRecord> {
        let owner = self.worker_id.clone();
        let ttl = self.settings.lease_ttl;
        let action = self.update_action(pid, |action| {
            if !action.is_in_flight() {
                return Err(FreezeError::InvalidRequest(format!(
                    "Action {pid} is not in progress"
                )));
            }
            let now = now_utc();
            if !action.lease_available_to(&owner, now) {
                return Err(FreezeError::LeaseConflict {
                    pid: pid.to_string(),
                    owner: action
                        .lease
                        .as_ref()
                        .map(|l| l.owner.clone())
                        .unwrap_or_default(),
                });
            }
            let acquired = match &action.lease {
                Some(lease) if lease.owner == owner && !lease.is_expired(now) => lease.acquired,
                _ => now,
            };
            action.lease = Some(Lease {
                owner: owner.clone(),
                acquired,
                expires: now + ttl,
            });
            action.heartbeat = Some(now);
            action.progress.halted = None;
            Ok(true)
        })?;
        debug!(pid, owner = %self.worker_id, "Claimed action");
        Ok(action)
    }

    /// Extend this worker's lease. Returns false once the lease belongs to
    /// someone else or the action left the in-flight state.
    pub(crate) fn renew_lease(&self, pid: &str) -> Result<bool> {
        let owner = self.worker_id.clone();
        let ttl = self.settings.lease_ttl;
        let mut held = false;
        self.update_action(pid, |action| {
            held = action.is_in_flight()
                && action.lease.as_ref().is_some_and(|lease| lease.owner == owner);
            if !held {
                return Ok(false);
            }
            let now = now_utc();
            if let Some(lease) = action.lease.as_mut() {
                lease.expires = now + ttl;
            }
            action.heartbeat = Some(now);
            Ok(true)
        })?;
        Ok(held)
    }

    /// Leave a suspended action resumable: drop our lease and mark it halted
    /// so that time spent suspended does not count as lack of progress.
    fn park(&self, pid: &str) -> Result<ActionRecord> {
        let owner = self.worker_id.clone();
        self.update_action(pid, |action| {
            if !action.is_in_flight() {
                return Ok(false);
            }
            let now = now_utc();
            match &action.lease {
                Some(lease) if lease.owner != owner && !lease.is_expired(now) => {
                    return Ok(false);
                }
                _ => {}
            }
            action.lease = None;
            action.heartbeat = Some(now);
            action.progress.halted = Some(now);
            Ok(true)
        })
    }

    fn lock_cancelled(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn cancel_pending(&self, pid: &str) -> bool {
        self.lock_cancelled().contains(pid)
    }

    /// Set the terminal timestamp from the recorded outcomes, or fail with
    /// `forced_error`. Emits the data change and prunes emptied folders when
    /// this call is the one that finished the action.
    async fn finalize(&self, pid: &str, forced_error: Option<&str>) -> Result<ActionRecord> {
        let records = self.stores.files.find_action_files(pid)?;
        let backend = self.storage.replication_backend();
        let mut finished_here = false;

        let action = self.update_action(pid, |action| {
            finished_here = false;
            if !action.is_in_flight() {
                return Ok(false);
            }
            let now = now_utc();
            action.pids = records.iter().map(|r| r.pid.clone()).collect();
            if action.action == ActionKind::Freeze {
                action.checksums = records
                    .iter()
                    .filter_map(|r| {
                        r.checksum_uri().map(|checksum| ChecksumEntry {
                            pid: r.pid.clone(),
                            pathname: r.pathname.clone(),
                            checksum,
                        })
                    })
                    .collect();
                action.replication = ReplicationStatus {
                    backend: backend.clone(),
                    replicated: records.iter().filter(|r| r.replicated.is_some()).count() as u64,
                    completed: records.iter().filter_map(|r| r.replicated).max(),
                };
            }
            match forced_error
                .map(str::to_string)
                .or_else(|| failure_summary(action))
            {
                Some(error) => {
                    action.failed = Some(now);
                    action.error = Some(error);
                }
                None => {
                    action.completed = Some(now);
                    action.error = None;
                }
            }
            action.lease = None;
            action.heartbeat = Some(now);
            finished_here = true;
            Ok(true)
        })?;
        self.lock_cancelled().remove(pid);

        if finished_here {
            match (&action.completed, &action.error) {
                (Some(_), _) => info!(pid, files = records.len(), "Action completed"),
                (None, Some(error)) => warn!(pid, error = %error, "Action failed"),
                _ => {}
            }
            self.after_finish(&action, &records).await;
        }
        Ok(action)
    }

    async fn after_finish(&self, action: &ActionRecord, records: &[FrozenFileRecord]) {
        if records.is_empty() {
            return;
        }
        let project = &action.project;
        let pathname = &action.pathname;
        let staging = format!("/{project}{STAGING_FOLDER_SUFFIX}{pathname}");
        let frozen = format!("/{project}{pathname}");
        let change = match action.action {
            ActionKind::Freeze => {
                NewDataChange::new(project, &action.user, ChangeKind::Move, staging)
                    .with_target(frozen)
            }
            ActionKind::Unfreeze => {
                NewDataChange::new(project, &action.user, ChangeKind::Move, frozen)
                    .with_target(staging)
            }
            ActionKind::Delete => {
                NewDataChange::new(project, &action.user, ChangeKind::Delete, frozen)
            }
        }
        .with_mode(ChangeMode::System);
        if let Err(e) = self.changes.record(change) {
            warn!(pid = %action.pid, "Failed to record data change: {}", e);
        }

        let area = Area::source_of(action.action);
        if let Err(e) = self.storage.prune(project, area, pathname).await {
            warn!(pid = %action.pid, "Failed to prune emptied folders: {}", e);
        }
    }
}
