//! Console front-end.
//!
//! Subscribes to the event bus and renders every engine event as a log
//! line. Purely an observer: the only path back into the engine is the
//! explicit pause/resume/shutdown commands the binary wires to signals.

use tokio::sync::broadcast;

use shepherd_events::WorkerEvent;

/// Render engine events until the bus closes.
pub async fn run(mut receiver: broadcast::Receiver<WorkerEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => render(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Console fell behind, some events were not shown");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn render(event: &WorkerEvent) {
    match event {
        WorkerEvent::StateChanged { from, to } => {
            tracing::info!(target: "console", %from, %to, "Engine state changed");
        }
        WorkerEvent::SessionEstablished => {
            tracing::info!(target: "console", "Signed in to the render farm");
        }
        WorkerEvent::JobAssigned { job_id } => {
            tracing::info!(target: "console", %job_id, "Job assigned");
        }
        WorkerEvent::RenderProgress { job_id, percent } => {
            tracing::info!(target: "console", %job_id, percent, "Rendering");
        }
        WorkerEvent::RenderCompleted {
            job_id,
            duration_secs,
        } => {
            tracing::info!(target: "console", %job_id, duration_secs, "Frame rendered");
        }
        WorkerEvent::RenderFailed { job_id, reason } => {
            tracing::warn!(target: "console", %job_id, %reason, "Render failed");
        }
        WorkerEvent::UploadStarted { job_id, attempt } => {
            tracing::info!(target: "console", %job_id, attempt, "Uploading frame");
        }
        WorkerEvent::UploadCompleted { job_id } => {
            tracing::info!(target: "console", %job_id, "Frame delivered");
        }
        WorkerEvent::UploadFailed { job_id, attempts } => {
            tracing::warn!(target: "console", %job_id, attempts, "Frame could not be delivered");
        }
    }
}
