//! HTTP surface.
//!
//! Caller identity comes from the `X-IDA-User` and `X-IDA-Projects` headers,
//! set by the authenticating front end.

pub mod handlers;
pub mod server;

pub use handlers::{AppState, ErrorResponse};
pub use server::{ApiConfig, ApiServer};
