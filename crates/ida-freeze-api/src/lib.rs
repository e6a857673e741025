//! Operation surface of the ida-freeze workflow: the [`ActionController`]
//! that authorizes and dispatches requests, the [`RetrySupervisor`] that
//! resumes stalled actions, and the axum HTTP server in [`http`].

pub mod controller;
pub mod http;
pub mod supervisor;

pub use controller::{ActionController, Actor};
pub use http::{ApiConfig, ApiServer};
pub use supervisor::{start_retry_supervisor, RetrySupervisor, SupervisorSettings, SweepReport};
