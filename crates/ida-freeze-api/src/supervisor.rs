/// Background supervisor resuming stalled actions
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ida_freeze_config::{now_utc, ActionRecord, SupervisorConfig};
use ida_freeze_core::{FreezeError, RunOutcome};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::controller::ActionController;

/// Configuration for the retry supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How often to sweep for stalled actions
    pub interval: Duration,
    /// Actions without a checkpoint for this long are resumed
    pub stale_after: chrono::Duration,
    /// Actions without a checkpoint for this long are failed
    pub hard_limit: chrono::Duration,
    pub max_concurrent_resumes: usize,
    /// Age after which removed and orphaned file records are purged
    pub retention: chrono::Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            stale_after: chrono::Duration::seconds(config.stale_after_secs as i64),
            hard_limit: chrono::Duration::seconds(config.hard_limit_secs as i64),
            max_concurrent_resumes: config.max_concurrent_resumes.max(1),
            retention: chrono::Duration::days(config.retention_days as i64),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stale: usize,
    pub resumed: usize,
    pub halted: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub errors: usize,
    pub purged: u64,
}

enum Resumed {
    Finished,
    Halted,
    Skipped,
    Failed,
}

/// Periodically resumes in-flight actions whose last checkpoint is older
/// than the stale threshold, and fails those stalled past the hard limit.
#[derive(Clone)]
pub struct RetrySupervisor {
    controller: ActionController,
    settings: SupervisorSettings,
}

impl RetrySupervisor {
    pub fn new(controller: ActionController, settings: SupervisorSettings) -> Self {
        Self {
            controller,
            settings,
        }
    }

    /// Start the background sweep loop
    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting retry supervisor with interval {} seconds",
            self.settings.interval.as_secs()
        );

        let mut interval = time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match self.run_sweep().await {
                Ok(report) if report == SweepReport::default() => debug!("Sweep found nothing to do"),
                Ok(report) => info!(?report, "Sweep completed"),
                Err(e) => error!("Sweep failed: {}", e),
            }
        }
    }

    /// Run a single sweep
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let engine = self.controller.engine();
        let now = now_utc();
        let stale = engine
            .stores()
            .actions
            .find_stale(now - self.settings.stale_after)?;

        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_resumes));
        let mut tasks = Vec::new();

        for action in stale {
            if self.leased_elsewhere(&action) {
                debug!(pid = %action.pid, "Action is leased by another worker");
                report.skipped += 1;
                continue;
            }
            if engine.suspension().is_suspended(&action.project) {
                debug!(pid = %action.pid, project = %action.project, "Project suspended");
                report.skipped += 1;
                continue;
            }

            // Time spent parked by a suspension is not a lack of progress.
            let idle = now - action.last_activity();
            if action.progress.halted.is_none() && idle > self.settings.hard_limit {
                let reason = FreezeError::Timeout(format!(
                    "No progress since {}",
                    action.last_activity().to_rfc3339()
                ));
                match engine.force_fail(&action.pid, &reason.to_string()).await {
                    Ok(_) => report.timed_out += 1,
                    Err(e) => {
                        warn!(pid = %action.pid, "Failed to time out action: {}", e);
                        report.errors += 1;
                    }
                }
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await?;
            let controller = self.controller.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                match controller.drive(&action.pid).await {
                    Ok(Some(RunOutcome::Finished(_))) => Resumed::Finished,
                    Ok(Some(RunOutcome::Halted { reason, .. })) => {
                        info!(pid = %action.pid, ?reason, "Resumed action halted");
                        Resumed::Halted
                    }
                    Ok(None) | Err(FreezeError::LeaseConflict { .. }) => Resumed::Skipped,
                    Err(e) => {
                        warn!(pid = %action.pid, "Failed to resume action: {}", e);
                        Resumed::Failed
                    }
                }
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Resumed::Finished) => report.resumed += 1,
                Ok(Resumed::Halted) => report.halted += 1,
                Ok(Resumed::Skipped) => report.skipped += 1,
                Ok(Resumed::Failed) => report.errors += 1,
                Err(e) => {
                    error!("Resume task panicked: {}", e);
                    report.errors += 1;
                }
            }
        }

        let cutoff = now - self.settings.retention;
        report.purged = engine
            .stores()
            .files
            .clear_expired(cutoff, cutoff, now_utc())?;

        Ok(report)
    }

    fn leased_elsewhere(&self, action: &ActionRecord) -> bool {
        match &action.lease {
            Some(lease) => {
                lease.owner != self.controller.engine().worker_id() && !lease.is_expired(now_utc())
            }
            None => false,
        }
    }
}

/// Start the retry supervisor in the background
pub fn start_retry_supervisor(supervisor: RetrySupervisor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(Arc::new(supervisor).start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Actor;
    use ida_freeze_config::{ActionKind, ActionState, ActionStore, FrozenFileStore};
    use ida_freeze_core::test_utils::TestHarness;
    use ida_freeze_core::{StartRequest, SuspensionSwitch};

    fn supervisor(harness: &TestHarness, settings: SupervisorSettings) -> RetrySupervisor {
        let engine = Arc::new(harness.engine_for_worker("sweeper", TestHarness::fast_settings()));
        let controller = ActionController::new(engine, harness.suspension.clone());
        RetrySupervisor::new(controller, settings)
    }

    fn eager() -> SupervisorSettings {
        SupervisorSettings {
            interval: Duration::from_millis(10),
            stale_after: chrono::Duration::zero(),
            hard_limit: chrono::Duration::hours(1),
            max_concurrent_resumes: 2,
            retention: chrono::Duration::days(30),
        }
    }

    fn request(kind: ActionKind, pathname: &str) -> StartRequest {
        StartRequest {
            project: "p1".to_string(),
            pathname: pathname.to_string(),
            kind,
            user: "alice".to_string(),
            batch: false,
        }
    }

    fn stored(h: &TestHarness, pid: &str) -> ActionRecord {
        h.persistence.get_action(pid).unwrap().unwrap()
    }

    async fn started(h: &TestHarness, pathname: &str) -> ActionRecord {
        let action = h
            .engine
            .start_action(request(ActionKind::Freeze, pathname))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        action
    }

    #[test]
    fn test_settings_from_config() {
        let settings = SupervisorSettings::default();
        assert!(settings.hard_limit > settings.stale_after);
        assert!(settings.max_concurrent_resumes >= 1);
    }

    #[tokio::test]
    async fn test_sweep_resumes_stale_action() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        h.fs.add_staged("p1", "/data/b", b"b");
        let action = started(&h, "/data").await;

        let report = supervisor(&h, eager()).run_sweep().await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.resumed, 1);

        let done = stored(&h, &action.pid);
        assert_eq!(done.state(), ActionState::Completed);
        assert_eq!(done.progress.processed, 2);
    }

    #[tokio::test]
    async fn test_sweep_times_out_action_past_hard_limit() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        let action = started(&h, "/data").await;

        let settings = SupervisorSettings {
            hard_limit: chrono::Duration::zero(),
            ..eager()
        };
        let report = supervisor(&h, settings).run_sweep().await.unwrap();
        assert_eq!(report.timed_out, 1);

        let failed = stored(&h, &action.pid);
        assert_eq!(failed.state(), ActionState::Failed);
        assert!(failed.error.unwrap().starts_with("Timeout:"));
        assert!(h.persistence.find_action_files(&action.pid).unwrap().is_empty());
        assert!(h.fs.is_staged("p1", "/data/a"));
    }

    #[tokio::test]
    async fn test_sweep_skips_leased_and_suspended_actions() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        h.fs.add_staged("p2", "/data/b", b"b");
        let leased = started(&h, "/data").await;
        h.engine.scan(&leased.pid).await.unwrap();

        let mut other = request(ActionKind::Freeze, "/data");
        other.project = "p2".to_string();
        h.engine.start_action(other).await.unwrap();
        h.suspension.set_project_suspended("p2", true).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = supervisor(&h, eager()).run_sweep().await.unwrap();
        assert_eq!(report.stale, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.resumed, 0);
        assert!(stored(&h, &leased.pid).is_in_flight());
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_file_records() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        let freeze = h.engine.start_action(request(ActionKind::Freeze, "/data")).await.unwrap();
        h.engine.run(&freeze.pid).await.unwrap();
        let unfreeze = h
            .engine
            .start_action(request(ActionKind::Unfreeze, "/data"))
            .await
            .unwrap();
        h.engine.run(&unfreeze.pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let settings = SupervisorSettings {
            retention: chrono::Duration::zero(),
            ..eager()
        };
        let report = supervisor(&h, settings).run_sweep().await.unwrap();
        assert!(report.purged >= 1);
        let records = h.persistence.find_action_files(&unfreeze.pid).unwrap();
        assert!(records.iter().all(|r| r.cleared.is_some()));
    }

    #[tokio::test]
    async fn test_long_suspension_does_not_time_out_action() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        let action = h
            .engine
            .start_action(request(ActionKind::Freeze, "/data"))
            .await
            .unwrap();
        h.engine.scan(&action.pid).await.unwrap();

        h.suspension.set_project_suspended("p1", true).unwrap();
        let outcome = h.engine.run(&action.pid).await.unwrap();
        assert!(outcome.halt_reason().is_some());
        let settings = SupervisorSettings {
            hard_limit: chrono::Duration::milliseconds(50),
            ..eager()
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.suspension.set_project_suspended("p1", false).unwrap();

        let report = supervisor(&h, settings).run_sweep().await.unwrap();
        assert_eq!(report.timed_out, 0);
        assert_eq!(report.resumed, 1);
        let done = stored(&h, &action.pid);
        assert_eq!(done.state(), ActionState::Completed);
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_suspended_project_is_resumed_after_unsuspend() {
        let h = TestHarness::new();
        h.fs.add_staged("p1", "/data/a", b"a");
        let action = started(&h, "/data").await;
        let sweeper = supervisor(&h, eager());

        sweeper
            .controller
            .suspend(&Actor::admin(), "p1")
            .unwrap();
        assert_eq!(sweeper.run_sweep().await.unwrap().skipped, 1);

        sweeper
            .controller
            .unsuspend(&Actor::admin(), "p1")
            .unwrap();
        assert_eq!(sweeper.run_sweep().await.unwrap().resumed, 1);
        assert_eq!(
            stored(&h, &action.pid).state(),
            ActionState::Completed
        );
    }
}
