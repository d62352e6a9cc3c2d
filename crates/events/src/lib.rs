//! Worker event bus.
//!
//! The engine publishes [`WorkerEvent`]s here; front-ends (console,
//! GUI) are independent subscribers with no backchannel into engine
//! state other than the explicit pause/resume/shutdown commands.

pub mod bus;

pub use bus::{EventBus, WorkerEvent};
