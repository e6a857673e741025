//! Durable freeze, unfreeze and delete actions for research data projects.

use std::sync::Arc;

use anyhow::{Context, Result};

pub use ida_freeze_api::{controller, http, supervisor};
pub use ida_freeze_config::{config, persistence, scope, store, types};
pub use ida_freeze_core::{changes, engine, error, files, pid, suspension};

use ida_freeze_api::{ActionController, RetrySupervisor, SupervisorSettings};
use ida_freeze_config::{AppConfig, Persistence};
use ida_freeze_core::{ActionEngine, EngineSettings, FlagFileSuspension, LocalFileSystem, Stores};

/// The wired up workflow: database, local file system, flag file suspension,
/// engine and controller, all built from one [`AppConfig`].
pub struct Service {
    pub config: AppConfig,
    pub controller: ActionController,
}

impl Service {
    pub fn open(config: AppConfig) -> Result<Self> {
        let persistence = Persistence::new(&config.storage.database)
            .context("Failed to open workflow database")?;
        let files = Arc::new(LocalFileSystem::from_config(&config.storage));
        let suspension = Arc::new(FlagFileSuspension::new(&config.storage.data_root));

        let engine = ActionEngine::new(
            Stores::from_persistence(persistence),
            files.clone(),
            files,
            suspension.clone(),
            EngineSettings::from(&config.engine),
        );
        tracing::debug!(worker = %engine.worker_id(), "Engine ready");

        let controller = ActionController::new(Arc::new(engine), suspension);
        Ok(Self { config, controller })
    }

    pub fn supervisor(&self) -> RetrySupervisor {
        RetrySupervisor::new(
            self.controller.clone(),
            SupervisorSettings::from(&self.config.supervisor),
        )
    }
}
