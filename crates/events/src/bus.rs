//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`WorkerEvent`]s. It is
//! shared via `Arc<EventBus>` between the engine (publisher) and any
//! number of front-ends (subscribers).

use serde::Serialize;
use tokio::sync::broadcast;

use shepherd_core::job::JobId;
use shepherd_core::state::EngineState;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// A state change or job lifecycle notification from the engine.
#[derive(Debug, Clone, Serialize)]
pub enum WorkerEvent {
    /// The engine moved between states.
    StateChanged { from: EngineState, to: EngineState },

    /// A session with the dispatch server was (re-)established.
    SessionEstablished,

    /// The server assigned a job to this worker.
    JobAssigned { job_id: JobId },

    /// Best-effort render progress (0-100), parsed from renderer output.
    RenderProgress { job_id: JobId, percent: u8 },

    /// A render finished successfully and was handed to the upload queue.
    RenderCompleted { job_id: JobId, duration_secs: u64 },

    /// A render failed or timed out; the job will not be uploaded.
    RenderFailed { job_id: JobId, reason: String },

    /// An upload attempt is starting.
    UploadStarted { job_id: JobId, attempt: u32 },

    /// The frame was delivered to the server.
    UploadCompleted { job_id: JobId },

    /// All upload attempts were exhausted and the result was dropped.
    UploadFailed { job_id: JobId, attempts: u32 },
}

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`WorkerEvent`]. Slow
/// subscribers that fall more than the channel capacity behind observe
/// `RecvError::Lagged` and miss the overwritten events.
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// the engine never blocks on slow or absent front-ends.
    pub fn publish(&self, event: WorkerEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
