//! The client work engine.
//!
//! [`engine::WorkEngine`] drives the fetch → prepare → render → upload
//! pipeline described in the module docs of each component:
//! [`allocator`] arbitrates CPU/GPU devices, [`supervisor`] runs and
//! polices the render subprocess, and [`upload`] delivers finished
//! frames in the background while the engine moves on to the next job.

pub mod allocator;
pub mod engine;
pub mod fetch;
pub mod supervisor;
pub mod upload;

pub use engine::{EngineError, WorkEngine};
