//! End-to-end engine tests against an in-memory dispatch server and a
//! shell-script renderer.

#![cfg(unix)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use shepherd_core::config::Config;
use shepherd_core::hardware::{GpuDevice, HardwareSummary, ProcessLauncher};
use shepherd_core::hashing::sha256_hex;
use shepherd_core::job::{AssetRef, ComputeType, FrameDescriptor, Job, RequestOutcome};
use shepherd_dispatch::{DispatchError, DispatchService, KeepAlive, Session, SessionManager};
use shepherd_engine::{EngineError, WorkEngine};
use shepherd_events::EventBus;

/// Scripted in-memory farm: hands out queued job outcomes, serves
/// assets from a map, records uploads and failure reports.
struct FarmStub {
    outcomes: Mutex<VecDeque<RequestOutcome>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    uploaded: Mutex<Vec<(String, Vec<u8>)>>,
    failures: Mutex<Vec<(String, String)>>,
    fetch_times: Mutex<Vec<Instant>>,
    upload_done_times: Mutex<Vec<Instant>>,
    request_count: AtomicUsize,
    upload_delay: Mutex<Duration>,
    fail_auth: AtomicBool,
}

impl FarmStub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            assets: Mutex::new(HashMap::new()),
            uploaded: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            fetch_times: Mutex::new(Vec::new()),
            upload_done_times: Mutex::new(Vec::new()),
            request_count: AtomicUsize::new(0),
            upload_delay: Mutex::new(Duration::ZERO),
            fail_auth: AtomicBool::new(false),
        })
    }

    fn serve_asset(&self, asset_id: &str, bytes: &[u8]) -> AssetRef {
        self.assets
            .lock()
            .unwrap()
            .insert(asset_id.to_string(), bytes.to_vec());
        AssetRef {
            asset_id: asset_id.to_string(),
            sha256: sha256_hex(bytes),
        }
    }

    fn script_outcome(&self, outcome: RequestOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn uploaded(&self) -> Vec<(String, Vec<u8>)> {
        self.uploaded.lock().unwrap().clone()
    }

    fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl DispatchService for FarmStub {
    async fn authenticate(&self, _hardware: &HardwareSummary) -> Result<Session, DispatchError> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(DispatchError::Auth("bad credentials".into()));
        }
        Ok(Session {
            token: "token".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            heartbeat: Duration::from_secs(3600),
        })
    }

    async fn request_job(
        &self,
        _token: &str,
        _compute: ComputeType,
        _gpu_model: Option<&str>,
    ) -> Result<RequestOutcome, DispatchError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.fetch_times.lock().unwrap().push(Instant::now());
        let next = self.outcomes.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| RequestOutcome::Fatal("no more scripted work".into())))
    }

    async fn download_asset(
        &self,
        _token: &str,
        asset_id: &str,
        dest: &Path,
    ) -> Result<(), DispatchError> {
        let bytes = self
            .assets
            .lock()
            .unwrap()
            .get(asset_id)
            .cloned()
            .ok_or_else(|| DispatchError::Fatal(format!("unknown asset {asset_id}")))?;
        std::fs::write(dest, bytes).map_err(|e| DispatchError::Fatal(e.to_string()))
    }

    async fn upload_result(
        &self,
        _token: &str,
        job_id: &str,
        artifact: &Path,
    ) -> Result<(), DispatchError> {
        let delay = *self.upload_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let bytes = std::fs::read(artifact).map_err(|e| DispatchError::Fatal(e.to_string()))?;
        self.uploaded
            .lock()
            .unwrap()
            .push((job_id.to_string(), bytes));
        self.upload_done_times.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn keep_alive(&self, _token: &str) -> Result<KeepAlive, DispatchError> {
        Ok(KeepAlive::Renewed)
    }

    async fn report_job_failure(
        &self,
        _token: &str,
        job_id: &str,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.failures
            .lock()
            .unwrap()
            .push((job_id.to_string(), reason.to_string()));
        Ok(())
    }
}

/// A renderer stand-in that writes `frame-data` to its `--output`
/// argument after an optional delay.
fn renderer_script(delay: &str) -> String {
    format!(
        r#"#!/bin/sh
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
sleep {delay}
echo "Fra:1 Rendered 64/64 Tiles"
printf frame-data > "$out"
"#
    )
}

const FAILING_SCRIPT: &str = "#!/bin/sh\nexit 2\n";

fn test_config(root: &Path) -> Arc<Config> {
    Arc::new(Config {
        server_url: "https://farm.example.org".into(),
        login: "renderer01".into(),
        password: "secret".into(),
        compute: ComputeType::CpuOnly,
        gpu_selector: None,
        cpu_cores: 2,
        cache_dir: root.join("cache"),
        cache_max_bytes: 1 << 20,
        work_dir: root.join("work"),
        max_concurrent_uploads: 2,
        upload_max_attempts: 3,
        download_max_attempts: 3,
        request_windows: Vec::new(),
        render_timeout_floor: Duration::from_secs(30),
        render_safety_factor: 1.0,
        shutdown_grace: Duration::from_secs(30),
    })
}

fn job(id: &str, renderer: AssetRef, scene: AssetRef) -> Job {
    Job {
        id: id.to_string(),
        compute: ComputeType::CpuOnly,
        renderer,
        scene,
        frame: FrameDescriptor {
            number: 1,
            extra_args: Vec::new(),
        },
        estimated_duration: Duration::ZERO,
        cpu_fallback_allowed: true,
    }
}

fn engine(farm: &Arc<FarmStub>, config: Arc<Config>) -> Arc<WorkEngine> {
    engine_with_gpu(farm, config, None)
}

fn engine_with_gpu(
    farm: &Arc<FarmStub>,
    config: Arc<Config>,
    gpu: Option<GpuDevice>,
) -> Arc<WorkEngine> {
    let events = Arc::new(EventBus::default());
    let service: Arc<dyn DispatchService> = farm.clone();
    let session = SessionManager::new(
        Arc::clone(&service),
        HardwareSummary {
            cpu_model: "test".into(),
            cores: 2,
            total_memory_kb: 0,
            gpus: gpu.iter().cloned().collect(),
        },
        Arc::clone(&events),
    );
    WorkEngine::new(
        config,
        gpu,
        service,
        session,
        ProcessLauncher::with_capability(false),
        events,
    )
    .unwrap()
}

async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn renders_and_uploads_an_assigned_job() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("blender-4.1", renderer_script("0").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job("job-1", renderer, scene)));

    let engine = engine(&farm, test_config(dir.path()));
    let result = engine.run().await;

    assert!(matches!(result, Err(EngineError::Fatal(_))));
    assert_eq!(
        farm.uploaded(),
        vec![("job-1".to_string(), b"frame-data".to_vec())]
    );
    assert!(farm.failures().is_empty());
}

#[tokio::test]
async fn failed_render_is_reported_and_never_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("bad-renderer", FAILING_SCRIPT.as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job("job-1", renderer, scene)));

    let engine = engine(&farm, test_config(dir.path()));
    let result = engine.run().await;

    assert!(matches!(result, Err(EngineError::Fatal(_))));
    assert!(farm.uploaded().is_empty());

    let failures = farm.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "job-1");
}

#[tokio::test]
async fn next_fetch_overlaps_with_previous_upload() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();
    *farm.upload_delay.lock().unwrap() = Duration::from_millis(400);

    let renderer = farm.serve_asset("blender-4.1", renderer_script("0").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job(
        "job-1",
        renderer.clone(),
        scene.clone(),
    )));
    farm.script_outcome(RequestOutcome::Assigned(job("job-2", renderer, scene)));

    let engine = engine(&farm, test_config(dir.path()));
    let result = engine.run().await;

    assert!(matches!(result, Err(EngineError::Fatal(_))));
    assert_eq!(farm.uploaded().len(), 2);

    // The second job request went out before the first upload landed.
    let fetch_times = farm.fetch_times.lock().unwrap();
    let upload_done = farm.upload_done_times.lock().unwrap();
    assert!(fetch_times[1] < upload_done[0]);
}

#[tokio::test]
async fn cpu_and_gpu_paths_render_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("blender-4.1", renderer_script("1").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");

    let mut job_1 = job("job-1", renderer.clone(), scene.clone());
    job_1.compute = ComputeType::CpuGpu;
    let mut job_2 = job("job-2", renderer, scene);
    job_2.compute = ComputeType::CpuGpu;
    farm.script_outcome(RequestOutcome::Assigned(job_1));
    farm.script_outcome(RequestOutcome::Assigned(job_2));

    let mut config = (*test_config(dir.path())).clone();
    config.compute = ComputeType::CpuGpu;
    config.gpu_selector = Some("CUDA_0".into());

    let gpu = GpuDevice {
        model: "RTX 3080".into(),
        memory_mb: 10240,
        identifier: "CUDA_0".into(),
    };
    let engine = engine_with_gpu(&farm, Arc::new(config), Some(gpu));

    let start = Instant::now();
    let result = engine.run().await;

    assert!(matches!(result, Err(EngineError::Fatal(_))));
    assert_eq!(farm.uploaded().len(), 2);
    assert!(farm.failures().is_empty());
    // One job took the GPU, the other fell back to CPU; two one-second
    // renders overlapped instead of running back to back.
    assert!(start.elapsed() < Duration::from_millis(1800));
}

#[tokio::test]
async fn shutdown_within_grace_lets_the_render_finish_and_upload() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("blender-4.1", renderer_script("1").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job("job-1", renderer, scene)));

    let engine = engine(&farm, test_config(dir.path()));
    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    // Let the render get going, then ask for a graceful stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.shutdown();

    let result = run.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(farm.uploaded().len(), 1);
}

#[tokio::test]
async fn shutdown_past_grace_cancels_the_render_and_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("blender-4.1", renderer_script("30").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job("job-1", renderer, scene)));

    let mut config = (*test_config(dir.path())).clone();
    config.shutdown_grace = Duration::from_millis(200);
    let engine = engine(&farm, Arc::new(config));

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    let shutdown_at = Instant::now();
    engine.shutdown();

    let result = run.await.unwrap();
    assert!(result.is_ok());
    assert!(shutdown_at.elapsed() < Duration::from_secs(10));
    assert!(farm.uploaded().is_empty());
}

#[tokio::test]
async fn pause_blocks_fetching_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();
    farm.script_outcome(RequestOutcome::NoJobAvailable);

    let engine = engine(&farm, test_config(dir.path()));
    engine.pause();

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(farm.request_count.load(Ordering::SeqCst), 0);

    engine.resume();
    wait_until(Duration::from_secs(5), || {
        farm.request_count.load(Ordering::SeqCst) >= 1
    })
    .await;

    engine.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn pause_during_render_lets_the_job_finish_and_upload() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();

    let renderer = farm.serve_asset("blender-4.1", renderer_script("1").as_bytes());
    let scene = farm.serve_asset("scene-9", b"scene bytes");
    farm.script_outcome(RequestOutcome::Assigned(job("job-1", renderer, scene)));

    let engine = engine(&farm, test_config(dir.path()));
    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    // Suspend while the render is in flight.
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.pause();

    wait_until(Duration::from_secs(10), || farm.uploaded().len() == 1).await;

    // Paused, so the engine never asked for a second job.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(farm.request_count.load(Ordering::SeqCst), 1);

    engine.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn rejected_credentials_stop_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let farm = FarmStub::new();
    farm.fail_auth.store(true, Ordering::SeqCst);

    let engine = engine(&farm, test_config(dir.path()));
    let result = engine.run().await;

    assert!(matches!(result, Err(EngineError::Auth(_))));
    assert_eq!(farm.request_count.load(Ordering::SeqCst), 0);
}
