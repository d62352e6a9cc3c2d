//! The orchestrating state machine.
//!
//! One loop drives Idle → Fetching → Preparing → Rendering and back,
//! publishing every transition on the event bus. Each assigned job runs
//! as its own task, so a CPU render and a GPU render can proceed in
//! parallel when the worker is configured for both; fetching is gated
//! on a free device path. Uploads run in the background pool, so the
//! engine is usually fetching its next job while earlier frames are
//! still being delivered.
//!
//! Control discipline:
//! - Suspension is a flag checked only at the Idle → Fetching edge; an
//!   in-flight render always finishes and its result is still uploaded.
//! - Shutdown is cooperative. `shutdown()` requests a stop; a render
//!   already running gets the configured grace period to finish, after
//!   which the hard-cancel token fires and the subprocess tree is
//!   killed. Cancellation points are before fetch, before spawn, and
//!   before each upload attempt.
//! - Only authentication failures and fatal server rejections stop the
//!   engine; every other failure is confined to the job it hit.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use shepherd_cache::{AssetCache, CacheConfig};
use shepherd_core::backoff::{Backoff, BackoffPolicy};
use shepherd_core::config::Config;
use shepherd_core::hardware::{GpuDevice, ProcessLauncher};
use shepherd_core::job::{ComputeType, ExitClassification, Job, RequestOutcome};
use shepherd_core::state::EngineState;
use shepherd_core::window::fetch_allowed;
use shepherd_dispatch::{DispatchError, DispatchService, SessionManager};
use shepherd_events::{EventBus, WorkerEvent};

use crate::allocator::{AllocatorError, HardwareAllocator};
use crate::fetch::DispatchFetcher;
use crate::supervisor::{RenderSupervisor, SupervisorConfig, SupervisorError};
use crate::upload::{UploadConfig, UploadQueue};

/// How often an engine outside its request window re-checks the clock.
const WINDOW_POLL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Credentials rejected. Surfaced to the operator; never retried
    /// blindly.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server rejected this worker in a way retrying cannot fix.
    #[error("Fatal server rejection: {0}")]
    Fatal(String),

    #[error("Engine setup failed: {0}")]
    Setup(String),
}

/// The work engine. Construct with [`WorkEngine::new`], drive with
/// [`run`](Self::run), and control from other tasks via
/// [`pause`](Self::pause) / [`resume`](Self::resume) /
/// [`shutdown`](Self::shutdown).
pub struct WorkEngine {
    config: Arc<Config>,
    gpu: Option<GpuDevice>,
    service: Arc<dyn DispatchService>,
    session: Arc<SessionManager>,
    cache: Arc<AssetCache>,
    allocator: HardwareAllocator,
    supervisor: RenderSupervisor,
    uploads: UploadQueue,
    events: Arc<EventBus>,

    /// Concurrent render tasks the loop may have outstanding: one per
    /// device path (CPU, plus the GPU when one is configured).
    render_paths: usize,

    state: std::sync::Mutex<EngineState>,
    paused: watch::Sender<bool>,
    /// Graceful stop requested.
    stop: CancellationToken,
    /// Grace period elapsed (or immediate abort): kill the render, cut
    /// retry waits short.
    hard_cancel: CancellationToken,
}

impl WorkEngine {
    pub fn new(
        config: Arc<Config>,
        gpu: Option<GpuDevice>,
        service: Arc<dyn DispatchService>,
        session: Arc<SessionManager>,
        launcher: ProcessLauncher,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, EngineError> {
        let stop = CancellationToken::new();
        let hard_cancel = CancellationToken::new();

        let fetcher = DispatchFetcher::new(Arc::clone(&service), Arc::clone(&session));
        let cache = AssetCache::open(
            CacheConfig {
                root: config.cache_dir.clone(),
                max_bytes: config.cache_max_bytes,
                download_attempts: config.download_max_attempts,
                backoff: BackoffPolicy::default(),
            },
            fetcher,
        )
        .map_err(|e| EngineError::Setup(e.to_string()))?;

        let allocator = HardwareAllocator::new(config.cpu_cores, gpu.clone());

        let supervisor = RenderSupervisor::new(
            SupervisorConfig {
                work_dir: config.work_dir.clone(),
                timeout_floor: config.render_timeout_floor,
                safety_factor: config.render_safety_factor,
            },
            launcher,
            Arc::clone(&events),
        );

        let uploads = UploadQueue::start(
            UploadConfig {
                max_concurrent: config.max_concurrent_uploads,
                max_attempts: config.upload_max_attempts,
                backoff: BackoffPolicy::default(),
            },
            Arc::clone(&service),
            Arc::clone(&session),
            Arc::clone(&events),
            hard_cancel.clone(),
        );

        let (paused, _) = watch::channel(false);

        let render_paths = match (config.compute, &gpu) {
            (ComputeType::CpuGpu, Some(_)) => 2,
            _ => 1,
        };

        Ok(Arc::new(Self {
            config,
            gpu,
            service,
            session,
            cache: Arc::new(cache),
            allocator,
            supervisor,
            uploads,
            events,
            render_paths,
            state: std::sync::Mutex::new(EngineState::Idle),
            paused,
            stop,
            hard_cancel,
        }))
    }

    /// Suspend job intake. A render already in progress finishes and
    /// its result is still uploaded; no new fetch happens until
    /// [`resume`](Self::resume).
    pub fn pause(&self) {
        tracing::info!("Pause requested");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        tracing::info!("Resume requested");
        self.paused.send_replace(false);
    }

    /// Request a graceful stop. Idle engines stop immediately; a
    /// running render gets the configured grace period before the
    /// subprocess tree is killed and its partial result discarded.
    pub fn shutdown(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        tracing::info!(
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Shutdown requested"
        );
        self.stop.cancel();

        let hard_cancel = self.hard_cancel.clone();
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hard_cancel.cancel();
        });
    }

    /// Drive the state machine until shutdown or a fatal error.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let keepalive = self.session.spawn_keepalive(self.hard_cancel.child_token());
        let mut fetch_backoff = Backoff::new(BackoffPolicy::default());
        let mut renders = tokio::task::JoinSet::new();

        let outcome = loop {
            if self.stop.is_cancelled() {
                break Ok(());
            }

            // Suspension gate: the only place the pause flag is read.
            if *self.paused.borrow() {
                self.set_state(EngineState::Paused);
                if !self.wait_for_resume().await {
                    break Ok(());
                }
                continue;
            }

            // Every device path busy (or its job still draining into
            // the upload queue): wait for a render task to finish
            // before asking for more work.
            if renders.len() >= self.render_paths
                || (!renders.is_empty() && !self.allocator.has_capacity(self.config.compute))
            {
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = renders.join_next() => {}
                }
                continue;
            }

            self.set_state(if self.uploads.pending() > 0 {
                EngineState::UploadingOverlapped
            } else {
                EngineState::Idle
            });

            let now = chrono::Local::now().time();
            if !fetch_allowed(&self.config.request_windows, now) {
                tracing::debug!("Outside request window, waiting");
                self.sleep_unless_stopped(WINDOW_POLL).await;
                continue;
            }

            self.set_state(EngineState::Fetching);
            match self.fetch_job().await {
                Err(e) => break Err(e),
                Ok(RequestOutcome::Assigned(job)) => {
                    fetch_backoff.reset();
                    tracing::info!(job_id = %job.id, frame = job.frame.number, "Job assigned");
                    self.events.publish(WorkerEvent::JobAssigned {
                        job_id: job.id.clone(),
                    });
                    let engine = Arc::clone(&self);
                    renders.spawn(async move { engine.process_job(job).await });
                }
                Ok(RequestOutcome::NoJobAvailable) | Ok(RequestOutcome::RetryLater) => {
                    let delay = fetch_backoff.next();
                    tracing::info!(delay_ms = delay.as_millis() as u64, "No job available, backing off");
                    self.set_state(EngineState::Idle);
                    self.sleep_unless_stopped(delay).await;
                }
                Ok(RequestOutcome::Fatal(reason)) => {
                    break Err(EngineError::Fatal(reason));
                }
            }
        };

        self.set_state(EngineState::Stopping);
        // In-flight renders finish or are killed by the grace timer;
        // either way their tasks end before uploads are drained.
        while renders.join_next().await.is_some() {}
        // Drain queued uploads; the hard-cancel token (fired by the
        // grace timer or below) cuts their retry waits short.
        self.uploads.close().await;
        self.hard_cancel.cancel();
        let _ = keepalive.await;
        self.set_state(EngineState::Stopped);
        tracing::info!("Engine stopped");
        outcome
    }

    // ---- private helpers ----

    /// Ask the server for work. Transient trouble (including a
    /// temporarily unreachable session) maps to `RetryLater` so the
    /// caller keeps backing off indefinitely; auth and validation
    /// rejections are fatal.
    async fn fetch_job(&self) -> Result<RequestOutcome, EngineError> {
        let token = match self.session.token().await {
            Ok(token) => token,
            Err(e) => return transient_or_fatal(e),
        };

        let (compute, gpu_model) = self.request_profile();
        match self
            .service
            .request_job(&token, compute, gpu_model.as_deref())
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => transient_or_fatal(e),
        }
    }

    /// What the worker advertises on a job request. A CPU-only worker
    /// asks for combined-type work without naming a GPU; the server
    /// never schedules pure-CPU project types.
    fn request_profile(&self) -> (ComputeType, Option<String>) {
        match (self.config.compute, &self.gpu) {
            (ComputeType::CpuOnly, _) => (ComputeType::CpuGpu, None),
            (compute, Some(gpu)) => (compute, Some(gpu.model.clone())),
            (compute, None) => (compute, None),
        }
    }

    /// Take one assigned job through prepare → render → hand-off.
    /// Job-level failures are reported and absorbed; only the engine
    /// loop decides to stop.
    async fn process_job(&self, job: Job) {
        self.set_state(EngineState::Preparing);

        let (renderer_res, scene_res) =
            tokio::join!(self.cache.ensure(&job.renderer), self.cache.ensure(&job.scene));

        let (renderer_path, scene_path) = match (renderer_res, scene_res) {
            (Ok(renderer), Ok(scene)) => (renderer, scene),
            (renderer, scene) => {
                let reason = renderer
                    .as_ref()
                    .err()
                    .or(scene.as_ref().err())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "asset preparation failed".into());
                if renderer.is_ok() {
                    self.cache.release(&job.renderer.sha256);
                }
                if scene.is_ok() {
                    self.cache.release(&job.scene.sha256);
                }
                self.fail_job(&job, &reason).await;
                return;
            }
        };

        let allocation = match self
            .allocator
            .acquire(job.compute, job.cpu_fallback_allowed)
        {
            Ok(allocation) => allocation,
            Err(AllocatorError::NoCompatibleDevice) => {
                self.release_assets(&job);
                self.fail_job(&job, "no compatible device available").await;
                return;
            }
        };

        // Cancellation point: never spawn a render into a shutdown.
        if self.stop.is_cancelled() {
            self.allocator.release(&allocation);
            self.release_assets(&job);
            return;
        }

        self.set_state(EngineState::Rendering);
        let result = self
            .supervisor
            .run(&job, &allocation, &renderer_path, &scene_path, &self.hard_cancel)
            .await;

        // The device is freed as soon as the render returns; it is
        // never held across the upload phase.
        self.allocator.release(&allocation);
        self.release_assets(&job);

        match result {
            Ok(result) if result.uploadable() => {
                self.events.publish(WorkerEvent::RenderCompleted {
                    job_id: result.job_id.clone(),
                    duration_secs: result.duration.as_secs(),
                });
                // Blocks when the pool is at capacity: upload lag is
                // the one thing allowed to throttle job intake.
                self.uploads.enqueue(result).await;
            }
            Ok(result) => {
                let reason = match result.status {
                    ExitClassification::Timeout => "render exceeded its deadline",
                    _ => "renderer failed or produced no artifact",
                };
                let _ = tokio::fs::remove_file(&result.artifact).await;
                self.fail_job(&job, reason).await;
            }
            Err(SupervisorError::Cancelled) => {
                tracing::info!(job_id = %job.id, "Render cancelled during shutdown, partial result discarded");
                let _ = tokio::fs::remove_file(self.supervisor.artifact_path(&job.id)).await;
            }
            Err(e) => {
                self.fail_job(&job, &format!("could not run renderer: {e}")).await;
            }
        }
    }

    fn release_assets(&self, job: &Job) {
        self.cache.release(&job.renderer.sha256);
        self.cache.release(&job.scene.sha256);
    }

    /// Mark a job failed locally and tell the server, best effort.
    async fn fail_job(&self, job: &Job, reason: &str) {
        tracing::warn!(job_id = %job.id, reason, "Job failed");
        self.events.publish(WorkerEvent::RenderFailed {
            job_id: job.id.clone(),
            reason: reason.to_string(),
        });

        if let Ok(token) = self.session.token().await {
            if let Err(e) = self
                .service
                .report_job_failure(&token, &job.id, reason)
                .await
            {
                tracing::debug!(job_id = %job.id, error = %e, "Failure report not delivered");
            }
        }
    }

    fn set_state(&self, to: EngineState) {
        let mut state = self.state.lock().expect("engine state poisoned");
        if *state == to {
            return;
        }
        let from = *state;
        *state = to;
        drop(state);

        tracing::debug!(from = %from, to = %to, "State changed");
        self.events.publish(WorkerEvent::StateChanged { from, to });
    }

    /// Sleep, returning early if a graceful stop is requested.
    async fn sleep_unless_stopped(&self, delay: std::time::Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Block until resumed. Returns `false` when a stop arrived first.
    async fn wait_for_resume(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if !*paused.borrow() {
                return true;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Map a dispatch error to the engine's retry-or-die decision.
fn transient_or_fatal(e: DispatchError) -> Result<RequestOutcome, EngineError> {
    match e {
        DispatchError::Transient(msg) => {
            tracing::warn!(error = %msg, "Server unreachable, will retry");
            Ok(RequestOutcome::RetryLater)
        }
        DispatchError::Auth(msg) => Err(EngineError::Auth(msg)),
        DispatchError::Fatal(msg) => Err(EngineError::Fatal(msg)),
    }
}
