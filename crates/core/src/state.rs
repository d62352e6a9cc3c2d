//! Engine state machine vocabulary.
//!
//! The work engine publishes every transition on the event bus, so the
//! state enum lives here where both the engine and its subscribers can
//! see it without depending on each other.

use serde::Serialize;

/// Observable states of the work engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Waiting for the next fetch to become eligible.
    Idle,
    /// Asking the server for a job.
    Fetching,
    /// Downloading assets and acquiring a device.
    Preparing,
    /// A render subprocess is running.
    Rendering,
    /// The engine is fetching while uploads from earlier jobs are still
    /// in flight.
    UploadingOverlapped,
    /// Suspended by the operator; no new fetches occur.
    Paused,
    /// Graceful stop in progress.
    Stopping,
    /// Terminal.
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Fetching => "fetching",
            EngineState::Preparing => "preparing",
            EngineState::Rendering => "rendering",
            EngineState::UploadingOverlapped => "uploading_overlapped",
            EngineState::Paused => "paused",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }

    /// No transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stopped_is_terminal() {
        assert!(EngineState::Stopped.is_terminal());
        assert!(!EngineState::Idle.is_terminal());
        assert!(!EngineState::Stopping.is_terminal());
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(EngineState::UploadingOverlapped.to_string(), "uploading_overlapped");
    }
}
