//! Action controller.
//!
//! Authorizes callers against the projects they belong to and dispatches to
//! the engine. Starting or retrying an action enumerates it synchronously so
//! scope errors reach the caller, then processes the files in the background.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use ida_freeze_config::scope::normalize_pathname;
use ida_freeze_config::{
    is_project_user, now_utc, ActionRecord, ActionStatus, DataChangeRecord, FrozenFileRecord,
};
use ida_freeze_core::suspension::check_gate;
use ida_freeze_core::{
    ActionEngine, Area, ChangeFilter, FileEntry, FreezeError, NewDataChange, Result, RunOutcome,
    StartRequest, SuspensionSwitch,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const ADMIN_USER: &str = "admin";

/// Files of a project in one or both areas, with the last recorded change.
#[derive(Debug, Clone, Serialize)]
pub struct FileInventory {
    pub project: String,
    pub created: DateTime<Utc>,
    pub scope: String,
    pub last_change: DataChangeRecord,
    pub staging: Vec<FileEntry>,
    /// Currently frozen file records.
    pub frozen: Vec<FrozenFileRecord>,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: String,
    /// Projects the user is a member of.
    pub projects: Vec<String>,
    pub admin: bool,
}

impl Actor {
    pub fn new(user: impl Into<String>, projects: Vec<String>) -> Self {
        let user = user.into();
        Self {
            admin: user == ADMIN_USER,
            user,
            projects,
        }
    }

    pub fn admin() -> Self {
        Self::new(ADMIN_USER, Vec::new())
    }

    /// Members, the project's service identity and administrators.
    pub fn may_access(&self, project: &str) -> bool {
        self.admin
            || is_project_user(&self.user, project)
            || self.projects.iter().any(|p| p == project)
    }

    /// Administrators and the project's service identity.
    pub fn is_privileged_for(&self, project: &str) -> bool {
        self.admin || is_project_user(&self.user, project)
    }

    fn authorize(&self, project: &str) -> Result<()> {
        if self.may_access(project) {
            Ok(())
        } else {
            Err(FreezeError::Forbidden(format!(
                "User {} does not belong to project {project}",
                self.user
            )))
        }
    }

    fn authorize_privileged(&self, project: &str) -> Result<()> {
        if self.is_privileged_for(project) {
            Ok(())
        } else {
            Err(FreezeError::Forbidden(format!(
                "Operation not permitted for user {}",
                self.user
            )))
        }
    }

    fn authorize_admin(&self) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            Err(FreezeError::Forbidden(
                "Operation requires administrator privileges".to_string(),
            ))
        }
    }

    /// Restrict a requested project list to what the actor may see. An empty
    /// result for a non-admin is reported as forbidden rather than as "all".
    fn visible_projects(&self, requested: &[String]) -> Result<Vec<String>> {
        if self.admin {
            return Ok(requested.to_vec());
        }
        let visible: Vec<String> = if requested.is_empty() {
            self.projects.clone()
        } else {
            requested
                .iter()
                .filter(|p| self.may_access(p))
                .cloned()
                .collect()
        };
        if visible.is_empty() {
            return Err(FreezeError::Forbidden(format!(
                "User {} has no accessible projects",
                self.user
            )));
        }
        Ok(visible)
    }
}

/// Removes a pid from the running set when dropped.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    pid: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.pid);
    }
}

fn lock(running: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct ActionController {
    engine: Arc<ActionEngine>,
    switch: Arc<dyn SuspensionSwitch>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl ActionController {
    /// `switch` must control the same flags the engine's oracle reads.
    pub fn new(engine: Arc<ActionEngine>, switch: Arc<dyn SuspensionSwitch>) -> Self {
        Self {
            engine,
            switch,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn engine(&self) -> &Arc<ActionEngine> {
        &self.engine
    }

    /// Start an action, enumerate it and process its files in the background.
    pub async fn start(&self, actor: &Actor, request: StartRequest) -> Result<ActionRecord> {
        let action = self.begin(actor, request).await?;
        self.spawn_run(&action.pid);
        Ok(action)
    }

    /// Start an action and process its files before returning.
    pub async fn execute(&self, actor: &Actor, request: StartRequest) -> Result<RunOutcome> {
        let action = self.begin(actor, request).await?;
        self.drive_now(&action.pid).await
    }

    /// Hand a failed action over to a new one and process it in the background.
    pub async fn retry(&self, actor: &Actor, pid: &str) -> Result<ActionRecord> {
        let retry = self.begin_retry(actor, pid).await?;
        self.spawn_run(&retry.pid);
        Ok(retry)
    }

    /// Hand a failed action over to a new one and process it before returning.
    pub async fn execute_retry(&self, actor: &Actor, pid: &str) -> Result<RunOutcome> {
        let retry = self.begin_retry(actor, pid).await?;
        self.drive_now(&retry.pid).await
    }

    async fn begin(&self, actor: &Actor, mut request: StartRequest) -> Result<ActionRecord> {
        actor.authorize(&request.project)?;
        request.user = actor.user.clone();
        let action = self.engine.start_action(request).await?;
        self.engine.scan(&action.pid).await
    }

    async fn begin_retry(&self, actor: &Actor, pid: &str) -> Result<ActionRecord> {
        let failed = self.action(pid)?;
        actor.authorize(&failed.project)?;
        let retry = self.engine.retry(pid, &actor.user)?;
        self.engine.scan(&retry.pid).await
    }

    async fn drive_now(&self, pid: &str) -> Result<RunOutcome> {
        self.drive(pid)
            .await?
            .ok_or_else(|| FreezeError::Conflict(format!("Action {pid} is already running")))
    }

    pub fn clear(&self, actor: &Actor, pid: &str) -> Result<ActionRecord> {
        let action = self.action(pid)?;
        actor.authorize(&action.project)?;
        self.engine.clear(pid)
    }

    /// Clear every completed or failed action matching `status`. `None` clears
    /// both. Returns the cleared actions.
    pub fn clear_all(
        &self,
        actor: &Actor,
        status: Option<ActionStatus>,
        projects: &[String],
    ) -> Result<Vec<ActionRecord>> {
        let statuses = match status {
            None => vec![ActionStatus::Completed, ActionStatus::Failed],
            Some(s @ (ActionStatus::Completed | ActionStatus::Failed)) => vec![s],
            Some(other) => {
                return Err(FreezeError::InvalidRequest(format!(
                    "Only completed or failed actions can be cleared, not {other}"
                )))
            }
        };
        let projects = actor.visible_projects(projects)?;
        let mut cleared = Vec::new();
        for status in statuses {
            for action in self
                .engine
                .stores()
                .actions
                .find_actions(Some(status), &projects)?
            {
                cleared.push(self.engine.clear(&action.pid)?);
            }
        }
        info!(user = %actor.user, count = cleared.len(), "Cleared actions");
        Ok(cleared)
    }

    pub async fn cancel(&self, actor: &Actor, pid: &str) -> Result<ActionRecord> {
        let action = self.action(pid)?;
        actor.authorize(&action.project)?;
        self.engine.request_cancel(pid).await
    }

    pub fn status(&self, actor: &Actor, pid: &str) -> Result<ActionRecord> {
        let action = self.action(pid)?;
        actor.authorize(&action.project)?;
        Ok(action)
    }

    /// Actions visible to `actor`, most recent first.
    pub fn list(
        &self,
        actor: &Actor,
        status: Option<ActionStatus>,
        projects: &[String],
    ) -> Result<Vec<ActionRecord>> {
        let projects = actor.visible_projects(projects)?;
        Ok(self.engine.stores().actions.find_actions(status, &projects)?)
    }

    pub fn count(
        &self,
        actor: &Actor,
        status: Option<ActionStatus>,
        projects: &[String],
    ) -> Result<u64> {
        let projects = actor.visible_projects(projects)?;
        Ok(self.engine.stores().actions.count_actions(status, &projects)?)
    }

    /// File records owned by an action, ordered by pathname.
    pub fn action_files(&self, actor: &Actor, pid: &str) -> Result<Vec<FrozenFileRecord>> {
        let action = self.action(pid)?;
        actor.authorize(&action.project)?;
        Ok(self.engine.stores().files.find_action_files(pid)?)
    }

    pub fn file(&self, actor: &Actor, pid: &str) -> Result<FrozenFileRecord> {
        let file = self
            .engine
            .stores()
            .files
            .find_file_by_pid(pid)?
            .ok_or_else(|| FreezeError::NotFound(format!("file {pid}")))?;
        actor.authorize(&file.project)?;
        Ok(file)
    }

    /// Currently frozen record of the file with the given node id.
    pub fn file_by_node(&self, actor: &Actor, node: i64) -> Result<FrozenFileRecord> {
        let file = self
            .engine
            .stores()
            .files
            .find_current_by_node(node)?
            .ok_or_else(|| FreezeError::NotFound(format!("frozen file with node {node}")))?;
        actor.authorize(&file.project)?;
        Ok(file)
    }

    /// Currently frozen record of a project relative pathname.
    pub fn file_by_pathname(
        &self,
        actor: &Actor,
        project: &str,
        pathname: &str,
    ) -> Result<FrozenFileRecord> {
        actor.authorize(project)?;
        let pathname = normalize_pathname(pathname)
            .ok_or_else(|| FreezeError::InvalidRequest(format!("Invalid pathname: {pathname}")))?;
        self.engine
            .stores()
            .files
            .find_frozen(project, Some(&pathname))?
            .into_iter()
            .find(|f| f.pathname == pathname)
            .ok_or_else(|| FreezeError::NotFound(format!("frozen file {pathname} in project {project}")))
    }

    /// PIDs of every file currently frozen in a project.
    pub fn frozen_pids(&self, actor: &Actor, project: &str) -> Result<Vec<String>> {
        actor.authorize(project)?;
        Ok(self.engine.stores().files.frozen_pids(project)?)
    }

    /// Inventory of the staging and frozen files of a project below `scope`.
    /// `area` restricts the inventory to one of the two trees.
    pub async fn inventory(
        &self,
        actor: &Actor,
        project: &str,
        area: Option<Area>,
        scope: Option<&str>,
    ) -> Result<FileInventory> {
        actor.authorize(project)?;
        let scope = match scope {
            Some(scope) => normalize_pathname(scope)
                .ok_or_else(|| FreezeError::InvalidRequest(format!("Invalid scope: {scope}")))?,
            None => "/".to_string(),
        };
        info!(project, ?area, scope = %scope, user = %actor.user, "File inventory");

        let staging = match area {
            None | Some(Area::Staging) => {
                self.engine
                    .lister()
                    .list_files(project, Area::Staging, &scope)
                    .await?
            }
            Some(Area::Frozen) => Vec::new(),
        };
        let frozen = match area {
            None | Some(Area::Frozen) => self
                .engine
                .stores()
                .files
                .find_frozen(project, Some(&scope))?,
            Some(Area::Staging) => Vec::new(),
        };
        let last_change = self
            .engine
            .changes()
            .last_change(project, &ChangeFilter::default())?;

        Ok(FileInventory {
            project: project.to_string(),
            created: now_utc(),
            scope,
            last_change,
            staging,
            frozen,
        })
    }

    /// Fail with `Conflict` if a side effecting operation on `pathname` would
    /// collide with suspension or with an unresolved action.
    pub fn scope_ok(&self, actor: &Actor, project: &str, pathname: &str) -> Result<()> {
        actor.authorize(project)?;
        check_gate(self.engine.suspension(), project)
            .map_err(|e| FreezeError::Conflict(e.to_string()))?;
        let conflicting = self
            .engine
            .stores()
            .actions
            .find_conflicting(project, pathname)?;
        if let Some(action) = conflicting.first() {
            debug!(project, pathname, pid = %action.pid, "Scope check failed");
            return Err(FreezeError::Conflict(format!(
                "Specified scope conflicts with an ongoing action: {}",
                action.pid
            )));
        }
        Ok(())
    }

    pub fn suspend(&self, actor: &Actor, project: &str) -> Result<()> {
        actor.authorize_privileged(project)?;
        self.switch.set_project_suspended(project, true)?;
        info!(project, user = %actor.user, "Project suspended");
        Ok(())
    }

    pub fn unsuspend(&self, actor: &Actor, project: &str) -> Result<()> {
        actor.authorize_privileged(project)?;
        self.switch.set_project_suspended(project, false)?;
        info!(project, user = %actor.user, "Project unsuspended");
        Ok(())
    }

    pub fn set_offline(&self, actor: &Actor, offline: bool) -> Result<()> {
        actor.authorize_admin()?;
        self.switch.set_service_offline(offline)?;
        info!(offline, user = %actor.user, "Service state changed");
        Ok(())
    }

    /// Record a data change. Only administrators and the project's service
    /// identity may write to the log directly.
    pub fn record_change(&self, actor: &Actor, change: NewDataChange) -> Result<DataChangeRecord> {
        actor.authorize_privileged(&change.project)?;
        self.engine.changes().record(change)
    }

    pub fn last_change(
        &self,
        actor: &Actor,
        project: &str,
        filter: &ChangeFilter,
    ) -> Result<DataChangeRecord> {
        actor.authorize(project)?;
        self.engine.changes().last_change(project, filter)
    }

    pub fn changes(
        &self,
        actor: &Actor,
        project: &str,
        filter: &ChangeFilter,
        limit: Option<usize>,
    ) -> Result<Vec<DataChangeRecord>> {
        actor.authorize(project)?;
        self.engine.changes().changes(project, filter, limit)
    }

    pub fn changes_since(
        &self,
        actor: &Actor,
        project: &str,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<DataChangeRecord>> {
        actor.authorize(project)?;
        self.engine.changes().since(project, since, limit)
    }

    pub fn init_details(&self, actor: &Actor, project: &str) -> Result<DataChangeRecord> {
        actor.authorize(project)?;
        self.engine.changes().init_details(project)
    }

    pub fn last_add(
        &self,
        actor: &Actor,
        project: &str,
        pathname: &str,
    ) -> Result<Option<DataChangeRecord>> {
        actor.authorize(project)?;
        self.engine.changes().last_add(project, pathname)
    }

    pub fn watch_changes(
        &self,
        actor: &Actor,
        project: &str,
        since: DateTime<Utc>,
        poll: Duration,
    ) -> Result<impl Stream<Item = DataChangeRecord> + Send + 'static> {
        actor.authorize(project)?;
        Ok(self.engine.changes().watch(project.to_string(), since, poll))
    }

    /// Run an action to completion or halt unless this process is already
    /// running it. Returns `None` when skipped.
    pub async fn drive(&self, pid: &str) -> Result<Option<RunOutcome>> {
        let Some(_guard) = self.try_mark_running(pid) else {
            debug!(pid, "Action already running in this process");
            return Ok(None);
        };
        self.engine.run(pid).await.map(Some)
    }

    pub fn is_running(&self, pid: &str) -> bool {
        lock(&self.running).contains(pid)
    }

    fn try_mark_running(&self, pid: &str) -> Option<RunGuard> {
        if !lock(&self.running).insert(pid.to_string()) {
            return None;
        }
        Some(RunGuard {
            running: self.running.clone(),
            pid: pid.to_string(),
        })
    }

    fn spawn_run(&self, pid: &str) {
        let controller = self.clone();
        let pid = pid.to_string();
        tokio::spawn(async move {
            match controller.drive(&pid).await {
                Ok(Some(RunOutcome::Finished(action))) => {
                    debug!(pid = %pid, state = ?action.state(), "Background run finished");
                }
                Ok(Some(RunOutcome::Halted { reason, .. })) => {
                    info!(pid = %pid, ?reason, "Background run halted");
                }
                Ok(None) => {}
                Err(FreezeError::LeaseConflict { owner, .. }) => {
                    warn!(pid = %pid, owner = %owner, "Action is processed by another worker");
                }
                Err(e) => error!(pid = %pid, "Background run failed: {}", e),
            }
        });
    }

    fn action(&self, pid: &str) -> Result<ActionRecord> {
        self.engine
            .stores()
            .actions
            .get_action(pid)?
            .ok_or_else(|| FreezeError::NotFound(format!("action {pid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ida_freeze_config::{ActionKind, ActionState, ChangeKind, SERVICE_USER};
    use ida_freeze_core::test_utils::TestHarness;
    use ida_freeze_core::{Stores, SuspensionOracle};

    struct Fixture {
        harness: TestHarness,
        controller: ActionController,
    }

    fn fixture() -> Fixture {
        let harness = TestHarness::new();
        let engine = Arc::new(harness.engine_for_worker("api", TestHarness::fast_settings()));
        let controller = ActionController::new(engine, harness.suspension.clone());
        Fixture {
            harness,
            controller,
        }
    }

    fn alice() -> Actor {
        Actor::new("alice", vec!["p1".to_string()])
    }

    fn freeze(pathname: &str) -> StartRequest {
        StartRequest {
            project: "p1".to_string(),
            pathname: pathname.to_string(),
            kind: ActionKind::Freeze,
            user: String::new(),
            batch: false,
        }
    }

    async fn wait_terminal(controller: &ActionController, pid: &str) -> ActionRecord {
        for _ in 0..200 {
            let action = controller.status(&Actor::admin(), pid).unwrap();
            if action.is_terminal() {
                return action;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("action {pid} did not finish");
    }

    #[test]
    fn test_actor_access() {
        let actor = alice();
        assert!(actor.may_access("p1"));
        assert!(!actor.may_access("p2"));
        assert!(!actor.is_privileged_for("p1"));
        assert!(Actor::new("PSO_p2", vec![]).is_privileged_for("p2"));
        assert!(Actor::admin().may_access("anything"));
        assert!(alice().visible_projects(&["p2".to_string()]).is_err());
        assert_eq!(alice().visible_projects(&[]).unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let f = fixture();
        f.harness.fs.add_staged("p1", "/data/a", b"a");
        let action = f.controller.start(&alice(), freeze("/data")).await.unwrap();
        assert_eq!(action.filecount, Some(1));
        assert_eq!(action.user, "alice");

        let done = wait_terminal(&f.controller, &action.pid).await;
        assert_eq!(done.state(), ActionState::Completed);
    }

    #[tokio::test]
    async fn test_execute_runs_in_foreground() {
        let f = fixture();
        f.harness.fs.add_staged("p1", "/data/a", b"a");
        f.harness.fs.fail_permanently("p1", "/data/a", "disk error");
        let outcome = f.controller.execute(&alice(), freeze("/data")).await.unwrap();
        let failed = outcome.into_action();
        assert_eq!(failed.state(), ActionState::Failed);

        f.harness.fs.clear_faults("p1", "/data/a");
        let retried = f
            .controller
            .execute_retry(&alice(), &failed.pid)
            .await
            .unwrap()
            .into_action();
        assert_eq!(retried.state(), ActionState::Completed);
        assert!(f.harness.fs.is_frozen("p1", "/data/a"));
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_project() {
        let f = fixture();
        f.harness.fs.add_staged("p2", "/data/a", b"a");
        let mut request = freeze("/data");
        request.project = "p2".to_string();
        let err = f.controller.start(&alice(), request).await.unwrap_err();
        assert!(matches!(err, FreezeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_scan_errors_reach_caller() {
        let f = fixture();
        f.harness.fs.add_folder("p1", ida_freeze_core::Area::Staging, "/empty");
        let err = f.controller.start(&alice(), freeze("/empty")).await.unwrap_err();
        assert!(matches!(err, FreezeError::EmptyScope(_)));
    }

    #[tokio::test]
    async fn test_retry_and_clear_all() {
        let f = fixture();
        f.harness.fs.add_staged("p1", "/data/a", b"a");
        f.harness.fs.fail_permanently("p1", "/data/a", "disk error");
        let action = f.controller.start(&alice(), freeze("/data")).await.unwrap();
        let failed = wait_terminal(&f.controller, &action.pid).await;
        assert_eq!(failed.state(), ActionState::Failed);

        f.harness.fs.clear_faults("p1", "/data/a");
        let retry = f.controller.retry(&alice(), &action.pid).await.unwrap();
        assert_eq!(retry.retrying.as_deref(), Some(action.pid.as_str()));
        let done = wait_terminal(&f.controller, &retry.pid).await;
        assert_eq!(done.state(), ActionState::Completed);

        let cleared = f.controller.clear_all(&alice(), None, &[]).unwrap();
        assert_eq!(cleared.len(), 1);
        assert_eq!(
            f.controller
                .count(&alice(), Some(ActionStatus::Cleared), &[])
                .unwrap(),
            2
        );
        assert!(f
            .controller
            .clear_all(&alice(), Some(ActionStatus::Pending), &[])
            .is_err());
    }

    #[tokio::test]
    async fn test_scope_ok() {
        let f = fixture();
        let actor = alice();
        f.controller.scope_ok(&actor, "p1", "/data").unwrap();

        let stores = Stores::from_persistence(f.harness.persistence.clone());
        let blocker = ida_freeze_config::ActionRecord::new(
            "a1",
            ActionKind::Freeze,
            "p1",
            "alice",
            "/data/sub",
            ida_freeze_config::now_utc(),
        );
        stores.actions.insert_exclusive(&blocker).unwrap();
        assert!(matches!(
            f.controller.scope_ok(&actor, "p1", "/data"),
            Err(FreezeError::Conflict(_))
        ));
        f.controller.scope_ok(&actor, "p1", "/other").unwrap();

        f.controller.suspend(&Actor::admin(), "p1").unwrap();
        assert!(matches!(
            f.controller.scope_ok(&actor, "p1", "/other"),
            Err(FreezeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_suspension_controls() {
        let f = fixture();
        assert!(matches!(
            f.controller.suspend(&alice(), "p1"),
            Err(FreezeError::Forbidden(_))
        ));
        f.controller
            .suspend(&Actor::new("PSO_p1", vec![]), "p1")
            .unwrap();
        assert!(f.harness.suspension.project_suspended("p1"));
        f.controller.unsuspend(&Actor::admin(), "p1").unwrap();
        assert!(!f.harness.suspension.project_suspended("p1"));

        assert!(f.controller.set_offline(&alice(), true).is_err());
        f.controller.set_offline(&Actor::admin(), true).unwrap();
        assert!(f.harness.suspension.service_offline());
        let err = f.controller.start(&alice(), freeze("/data")).await.unwrap_err();
        assert!(matches!(err, FreezeError::ServiceOffline));
    }

    #[tokio::test]
    async fn test_data_change_permissions() {
        let f = fixture();
        let change = NewDataChange::new("p1", "alice", ChangeKind::Add, "/p1+/a.txt");
        assert!(matches!(
            f.controller.record_change(&alice(), change.clone()),
            Err(FreezeError::Forbidden(_))
        ));
        let recorded = f
            .controller
            .record_change(&Actor::new("PSO_p1", vec![]), change)
            .unwrap();
        assert_eq!(recorded.user, "alice");

        let last = f
            .controller
            .last_add(&alice(), "p1", "/a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(last.pathname, "/p1+/a.txt");

        let init = f.controller.init_details(&alice(), "p1").unwrap();
        assert_eq!(init.user, SERVICE_USER);
        assert!(f.controller.init_details(&alice(), "p2").is_err());
    }

    #[tokio::test]
    async fn test_frozen_file_lookups() {
        let f = fixture();
        let node = f.harness.fs.add_staged("p1", "/data/a", b"a");
        f.harness.fs.add_staged("p1", "/data/b", b"b");
        let outcome = f.controller.execute(&alice(), freeze("/data/a")).await.unwrap();
        assert_eq!(outcome.into_action().state(), ActionState::Completed);

        let by_node = f.controller.file_by_node(&alice(), node).unwrap();
        assert_eq!(by_node.pathname, "/data/a");
        let by_path = f.controller.file_by_pathname(&alice(), "p1", "data/a/").unwrap();
        assert_eq!(by_path.pid, by_node.pid);
        assert_eq!(
            f.controller.frozen_pids(&alice(), "p1").unwrap(),
            vec![by_node.pid.clone()]
        );

        assert!(matches!(
            f.controller.file_by_pathname(&alice(), "p1", "/data/b"),
            Err(FreezeError::NotFound(_))
        ));
        assert!(matches!(
            f.controller.file_by_pathname(&alice(), "p1", "/data"),
            Err(FreezeError::NotFound(_))
        ));
        assert!(matches!(
            f.controller.file_by_node(&alice(), 9999),
            Err(FreezeError::NotFound(_))
        ));
        let bob = Actor::new("bob", vec!["p2".to_string()]);
        assert!(matches!(
            f.controller.file_by_node(&bob, node),
            Err(FreezeError::Forbidden(_))
        ));
        assert!(f.controller.frozen_pids(&bob, "p1").is_err());
    }

    #[tokio::test]
    async fn test_inventory_lists_both_areas() {
        let f = fixture();
        f.harness.fs.add_staged("p1", "/data/a", b"a");
        f.harness.fs.add_staged("p1", "/data/b", b"b");
        f.harness.fs.add_staged("p1", "/other/c", b"c");
        f.controller.execute(&alice(), freeze("/data/a")).await.unwrap();

        let all = f.controller.inventory(&alice(), "p1", None, None).await.unwrap();
        assert_eq!(all.scope, "/");
        let staged: Vec<_> = all.staging.iter().map(|e| e.pathname.as_str()).collect();
        assert_eq!(staged, vec!["/data/b", "/other/c"]);
        assert_eq!(all.frozen.len(), 1);
        assert_eq!(all.frozen[0].pathname, "/data/a");
        assert_eq!(all.last_change.change, ChangeKind::Move);
        assert_eq!(all.last_change.target.as_deref(), Some("/p1/data/a"));

        let frozen_only = f
            .controller
            .inventory(&alice(), "p1", Some(Area::Frozen), Some("/data"))
            .await
            .unwrap();
        assert!(frozen_only.staging.is_empty());
        assert_eq!(frozen_only.frozen.len(), 1);

        let staged_only = f
            .controller
            .inventory(&alice(), "p1", Some(Area::Staging), Some("/other"))
            .await
            .unwrap();
        assert!(staged_only.frozen.is_empty());
        assert_eq!(staged_only.staging.len(), 1);

        assert!(f.controller.inventory(&alice(), "p2", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_drive_skips_action_already_running() {
        let f = fixture();
        let guard = f.controller.try_mark_running("a1");
        assert!(guard.is_some());
        assert!(f.controller.drive("a1").await.unwrap().is_none());
        drop(guard);
        assert!(!f.controller.is_running("a1"));
    }
}
