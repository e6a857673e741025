//! Configuration, record types and persistence for the ida-freeze workflow.
//!
//! The record types mirror the three durable tables (actions, frozen files and
//! data changes). Store traits describe what the workflow engine needs from a
//! backend; [`persistence::Persistence`] implements them on DuckDB.

pub mod config;
pub mod persistence;
pub mod scope;
pub mod store;
pub mod types;

pub use config::{
    AppConfig, ConfigError, EngineConfig, HttpConfig, LoggingConfig, StorageConfig,
    SupervisorConfig,
};
pub use persistence::Persistence;
pub use store::{
    ActionStore, DataChangeQuery, DataChangeStore, FileCommit, FileWrite, FrozenFileStore,
    StoreError, StoreResult,
};
pub use types::*;
