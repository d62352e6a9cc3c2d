//! Background result delivery.
//!
//! The queue decouples "job finished rendering" from "frame delivered".
//! Capacity is bounded: when every slot is taken, [`UploadQueue::enqueue`]
//! blocks the engine, which is the only backpressure path onto the main
//! loop. Workers retry transient upload errors with backoff up to a
//! bounded attempt count; exhausting the budget drops the result and
//! frees the slot so a dead server can never stall job intake forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use shepherd_core::backoff::{Backoff, BackoffPolicy};
use shepherd_core::job::RenderResult;
use shepherd_dispatch::{DispatchService, SessionManager};
use shepherd_events::{EventBus, WorkerEvent};

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Concurrent uploads; also the enqueue capacity.
    pub max_concurrent: usize,
    /// Attempts per result before it is dropped.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

struct UploadContext {
    service: Arc<dyn DispatchService>,
    session: Arc<SessionManager>,
    events: Arc<EventBus>,
    config: UploadConfig,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
}

/// Bounded pool of upload workers fed by an mpsc channel.
pub struct UploadQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<RenderResult>>>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    ctx: Arc<UploadContext>,
}

impl UploadQueue {
    /// Spawn the worker pool. `cancel` aborts retry waits during a hard
    /// shutdown; queued work is otherwise drained on [`close`](Self::close).
    pub fn start(
        config: UploadConfig,
        service: Arc<dyn DispatchService>,
        session: Arc<SessionManager>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.max_concurrent);
        let rx = Arc::new(Mutex::new(rx));

        let ctx = Arc::new(UploadContext {
            service,
            session,
            events,
            config,
            cancel,
            in_flight: AtomicUsize::new(0),
        });

        let workers = (0..ctx.config.max_concurrent)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    worker_loop(rx, ctx).await;
                    tracing::debug!(worker, "Upload worker exited");
                })
            })
            .collect();

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(workers),
            ctx,
        }
    }

    /// Hand a successful render to the pool. Blocks while the queue is
    /// at capacity.
    pub async fn enqueue(&self, result: RenderResult) {
        let tx = self
            .tx
            .lock()
            .expect("upload queue poisoned")
            .clone();

        let Some(tx) = tx else {
            tracing::error!(job_id = %result.job_id, "Upload queue already closed, dropping result");
            return;
        };

        self.ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = tx.send(result).await {
            self.ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(job_id = %e.0.job_id, "Upload queue closed, dropping result");
        }
    }

    /// Results queued or being uploaded right now.
    pub fn pending(&self) -> usize {
        self.ctx.in_flight.load(Ordering::SeqCst)
    }

    /// Close intake and wait for the workers to drain the queue.
    pub async fn close(&self) {
        self.tx.lock().expect("upload queue poisoned").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("upload queue poisoned"));
        let _ = futures::future::join_all(workers).await;
    }
}

async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<RenderResult>>>, ctx: Arc<UploadContext>) {
    loop {
        // Hold the receiver lock only while waiting for the next task;
        // processing runs unlocked so the pool uploads concurrently.
        let task = { rx.lock().await.recv().await };
        let Some(result) = task else {
            return;
        };
        upload_with_retries(&ctx, result).await;
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn upload_with_retries(ctx: &UploadContext, result: RenderResult) {
    let job_id = result.job_id.clone();
    let mut backoff = Backoff::new(ctx.config.backoff.clone());

    for attempt in 1..=ctx.config.max_attempts {
        if ctx.cancel.is_cancelled() {
            tracing::info!(job_id = %job_id, "Shutdown in progress, abandoning upload");
            return;
        }

        ctx.events.publish(WorkerEvent::UploadStarted {
            job_id: job_id.clone(),
            attempt,
        });

        let outcome = async {
            let token = ctx.session.token().await?;
            ctx.service
                .upload_result(&token, &job_id, &result.artifact)
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                tracing::info!(job_id = %job_id, attempt, "Frame delivered");
                ctx.events
                    .publish(WorkerEvent::UploadCompleted { job_id });
                let _ = tokio::fs::remove_file(&result.artifact).await;
                return;
            }
            Err(e) if e.is_transient() && attempt < ctx.config.max_attempts => {
                let delay = backoff.next();
                tracing::warn!(
                    job_id = %job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upload failed, backing off"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    attempt,
                    error = %e,
                    "Upload failed permanently, dropping result"
                );
                ctx.events.publish(WorkerEvent::UploadFailed {
                    job_id,
                    attempts: attempt,
                });
                return;
            }
        }
    }
}
