//! Suspension gate.
//!
//! Work may only proceed while neither the service nor the project is
//! suspended. The gate is consulted before an action starts and before every
//! per-file step, so a long running action can be paused mid flight.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Context};
use ida_freeze_config::scope::is_root;
use ida_freeze_config::{format_timestamp, is_project_user, now_utc, PROJECT_USER_PREFIX};
use tracing::{info, warn};

use crate::error::{FreezeError, Result};

/// Read side of the suspension flags.
pub trait SuspensionOracle: Send + Sync {
    fn service_offline(&self) -> bool;

    fn service_suspended(&self) -> bool;

    fn project_suspended(&self, project: &str) -> bool;

    fn is_suspended(&self, project: &str) -> bool {
        self.service_offline() || self.service_suspended() || self.project_suspended(project)
    }
}

/// Write side of the suspension flags.
pub trait SuspensionSwitch: SuspensionOracle {
    fn set_service_offline(&self, offline: bool) -> anyhow::Result<()>;

    fn set_service_suspended(&self, suspended: bool) -> anyhow::Result<()>;

    fn set_project_suspended(&self, project: &str, suspended: bool) -> anyhow::Result<()>;
}

/// Fail with the matching error if work on `project` is gated.
pub fn check_gate(oracle: &dyn SuspensionOracle, project: &str) -> Result<()> {
    if oracle.service_offline() {
        return Err(FreezeError::ServiceOffline);
    }
    if oracle.service_suspended() || oracle.project_suspended(project) {
        return Err(FreezeError::Suspended(project.to_string()));
    }
    Ok(())
}

/// The root folders of a project may only be mutated by its service identity.
pub fn check_root_mutation(user: &str, project: &str, pathname: &str) -> Result<()> {
    if is_root(pathname) && !is_project_user(user, project) {
        return Err(FreezeError::Forbidden(
            "Root project folders cannot be modified by project users".to_string(),
        ));
    }
    Ok(())
}

/// Suspension flags kept as marker files under the data root:
/// `control/OFFLINE`, `control/SUSPENDED` and `PSO_<project>/files/SUSPENDED`.
#[derive(Debug, Clone)]
pub struct FlagFileSuspension {
    data_root: PathBuf,
}

impl FlagFileSuspension {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    fn offline_flag(&self) -> PathBuf {
        self.data_root.join("control").join("OFFLINE")
    }

    fn suspended_flag(&self) -> PathBuf {
        self.data_root.join("control").join("SUSPENDED")
    }

    fn project_flag(&self, project: &str) -> PathBuf {
        self.data_root
            .join(format!("{PROJECT_USER_PREFIX}{project}"))
            .join("files")
            .join("SUSPENDED")
    }

    fn set_flag(path: &Path, on: bool) -> anyhow::Result<()> {
        if on {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, format_timestamp(&now_utc()))
                .with_context(|| format!("failed to write flag {}", path.display()))?;
        } else if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove flag {}", path.display()))?;
        }
        Ok(())
    }
}

impl SuspensionOracle for FlagFileSuspension {
    fn service_offline(&self) -> bool {
        self.offline_flag().exists()
    }

    fn service_suspended(&self) -> bool {
        self.suspended_flag().exists()
    }

    fn project_suspended(&self, project: &str) -> bool {
        self.project_flag(project).exists()
    }
}

impl SuspensionSwitch for FlagFileSuspension {
    fn set_service_offline(&self, offline: bool) -> anyhow::Result<()> {
        info!(offline, "Setting service offline flag");
        Self::set_flag(&self.offline_flag(), offline)
    }

    fn set_service_suspended(&self, suspended: bool) -> anyhow::Result<()> {
        info!(suspended, "Setting service suspended flag");
        Self::set_flag(&self.suspended_flag(), suspended)
    }

    fn set_project_suspended(&self, project: &str, suspended: bool) -> anyhow::Result<()> {
        let flag = self.project_flag(project);
        let project_root = self.data_root.join(format!("{PROJECT_USER_PREFIX}{project}"));
        if suspended && !project_root.exists() {
            warn!(project, "Suspending project without a data directory");
        }
        info!(project, suspended, "Setting project suspended flag");
        Self::set_flag(&flag, suspended)
    }
}

/// In-process suspension flags.
#[derive(Debug, Default)]
pub struct StaticSuspension {
    offline: AtomicBool,
    suspended: AtomicBool,
    projects: RwLock<HashSet<String>>,
}

impl StaticSuspension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SuspensionOracle for StaticSuspension {
    fn service_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn service_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn project_suspended(&self, project: &str) -> bool {
        self.projects
            .read()
            .map(|projects| projects.contains(project))
            .unwrap_or(true)
    }
}

impl SuspensionSwitch for StaticSuspension {
    fn set_service_offline(&self, offline: bool) -> anyhow::Result<()> {
        self.offline.store(offline, Ordering::SeqCst);
        Ok(())
    }

    fn set_service_suspended(&self, suspended: bool) -> anyhow::Result<()> {
        self.suspended.store(suspended, Ordering::SeqCst);
        Ok(())
    }

    fn set_project_suspended(&self, project: &str, suspended: bool) -> anyhow::Result<()> {
        let mut projects = self
            .projects
            .write()
            .map_err(|_| anyhow!("suspension flag lock poisoned"))?;
        if suspended {
            projects.insert(project.to_string());
        } else {
            projects.remove(project);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_files() {
        let dir = tempfile::tempdir().unwrap();
        let gate = FlagFileSuspension::new(dir.path());
        assert!(!gate.is_suspended("p1"));

        gate.set_project_suspended("p1", true).unwrap();
        assert!(dir.path().join("PSO_p1/files/SUSPENDED").exists());
        assert!(gate.project_suspended("p1"));
        assert!(!gate.project_suspended("p2"));
        assert!(matches!(
            check_gate(&gate, "p1"),
            Err(FreezeError::Suspended(_))
        ));

        gate.set_project_suspended("p1", false).unwrap();
        assert!(check_gate(&gate, "p1").is_ok());
        // Clearing an absent flag is a no-op.
        gate.set_project_suspended("p1", false).unwrap();
    }

    #[test]
    fn test_offline_reported_before_suspension() {
        let dir = tempfile::tempdir().unwrap();
        let gate = FlagFileSuspension::new(dir.path());
        gate.set_service_suspended(true).unwrap();
        gate.set_service_offline(true).unwrap();
        assert!(dir.path().join("control/OFFLINE").exists());
        assert!(matches!(
            check_gate(&gate, "p1"),
            Err(FreezeError::ServiceOffline)
        ));

        gate.set_service_offline(false).unwrap();
        assert!(matches!(
            check_gate(&gate, "p1"),
            Err(FreezeError::Suspended(_))
        ));
    }

    #[test]
    fn test_static_suspension() {
        let gate = StaticSuspension::new();
        gate.set_project_suspended("p1", true).unwrap();
        assert!(gate.is_suspended("p1"));
        assert!(!gate.is_suspended("p2"));
        gate.set_service_suspended(true).unwrap();
        assert!(gate.is_suspended("p2"));
    }

    #[test]
    fn test_root_mutation_requires_service_identity() {
        assert!(matches!(
            check_root_mutation("alice", "p1", "/"),
            Err(FreezeError::Forbidden(_))
        ));
        assert!(check_root_mutation("PSO_p1", "p1", "/").is_ok());
        assert!(check_root_mutation("alice", "p1", "/data").is_ok());
    }
}
