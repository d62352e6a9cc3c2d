//! Dispatch-server facade.
//!
//! [`api::DispatchApi`] wraps the farm's HTTP API with timeout handling
//! and Transient/Fatal error classification; [`session::SessionManager`]
//! owns the authentication token and the keepalive cadence. The engine
//! talks to both only through the [`api::DispatchService`] trait so
//! tests can substitute an in-memory server.

pub mod api;
pub mod messages;
pub mod session;

pub use api::{DispatchApi, DispatchError, DispatchService, KeepAlive};
pub use session::{Session, SessionManager};
