//! Core of the ida-freeze workflow.
//!
//! The [`engine::ActionEngine`] drives freeze, unfreeze and delete actions
//! through their lifecycle. It talks to durable state only through the store
//! traits of `ida-freeze-config`, to the file system only through the
//! [`files`] collaborator traits, and asks a [`suspension::SuspensionOracle`]
//! before every step whether work may proceed.

pub mod changes;
pub mod engine;
pub mod error;
pub mod files;
pub mod pid;
pub mod suspension;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use changes::{ChangeFilter, DataChangeLog, NewDataChange};
pub use engine::{ActionEngine, EngineSettings, HaltReason, RunOutcome, StartRequest, Stores};
pub use error::{FreezeError, Result};
pub use files::{Area, FileDigest, FileEntry, FileError, FileLister, FileStorage, LocalFileSystem};
pub use suspension::{
    FlagFileSuspension, StaticSuspension, SuspensionOracle, SuspensionSwitch,
};
