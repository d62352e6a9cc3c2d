//! Render subprocess supervision.
//!
//! Spawns the renderer at low OS priority, merges its stdout/stderr,
//! scans the output for progress lines, and enforces a wall-clock
//! deadline. On timeout or cancellation the whole process group is
//! terminated so helper processes the renderer spawned die with it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shepherd_core::hardware::launcher::{kill_process_tree, ProcessLauncher};
use shepherd_core::job::{render_deadline, Allocation, ExitClassification, Job, RenderResult};
use shepherd_events::{EventBus, WorkerEvent};

/// Renderer output lines starting with this token carry progress.
pub const PROGRESS_PREFIX: &str = "Fra:";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Scratch directory render artifacts are written into.
    pub work_dir: PathBuf,
    /// Minimum deadline regardless of the server's estimate.
    pub timeout_floor: std::time::Duration,
    /// Multiplier applied to the server's duration estimate.
    pub safety_factor: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Renderer process error: {0}")]
    Io(#[from] std::io::Error),

    /// The render was cancelled (shutdown grace period elapsed). The
    /// partial result must be discarded.
    #[error("Render cancelled")]
    Cancelled,
}

/// Spawns and polices one render subprocess at a time per caller.
pub struct RenderSupervisor {
    config: SupervisorConfig,
    launcher: ProcessLauncher,
    events: Arc<EventBus>,
}

impl RenderSupervisor {
    pub fn new(config: SupervisorConfig, launcher: ProcessLauncher, events: Arc<EventBus>) -> Self {
        Self {
            config,
            launcher,
            events,
        }
    }

    /// Where the renderer is told to write the frame for `job_id`.
    pub fn artifact_path(&self, job_id: &str) -> PathBuf {
        self.config.work_dir.join(format!("{job_id}.frame"))
    }

    /// Run the renderer for `job` to completion, timeout, or
    /// cancellation.
    ///
    /// Success requires exit code 0 and a non-empty artifact; anything
    /// else is a `Failure`. A `Timeout` or `Failure` result never
    /// reaches the upload pipeline.
    pub async fn run(
        &self,
        job: &Job,
        allocation: &Allocation,
        renderer: &Path,
        scene: &Path,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, SupervisorError> {
        let artifact = self.artifact_path(&job.id);
        let _ = tokio::fs::remove_file(&artifact).await;
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let deadline = render_deadline(
            job.estimated_duration,
            self.config.timeout_floor,
            self.config.safety_factor,
        );

        let mut cmd = self.launcher.command(renderer);
        cmd.arg(scene)
            .arg("--frame")
            .arg(job.frame.number.to_string())
            .arg("--output")
            .arg(&artifact);
        match allocation {
            Allocation::Cpu { cores } => {
                cmd.arg("--threads").arg(cores.to_string());
            }
            Allocation::Gpu { device } => {
                cmd.arg("--gpu").arg(&device.identifier);
            }
        }
        cmd.args(&job.frame.extra_args);

        tracing::info!(
            job_id = %job.id,
            frame = job.frame.number,
            deadline_secs = deadline.as_secs(),
            "Starting render"
        );

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        // Merge both output streams into one line channel and scan it
        // for progress in the background. Parse misses are not errors.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx);
        }

        let events = Arc::clone(&self.events);
        let job_id = job.id.clone();
        let scanner = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if let Some(percent) = parse_progress(&line) {
                    events.publish(WorkerEvent::RenderProgress {
                        job_id: job_id.clone(),
                        percent,
                    });
                }
            }
        });

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(deadline) => None,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job.id, "Cancelling render");
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                let _ = scanner.await;
                return Err(SupervisorError::Cancelled);
            }
        };

        let classification = match status {
            Some(status) => {
                let artifact_ok = tokio::fs::metadata(&artifact)
                    .await
                    .map(|m| m.len() > 0)
                    .unwrap_or(false);
                if status.success() && artifact_ok {
                    ExitClassification::Success
                } else {
                    tracing::warn!(
                        job_id = %job.id,
                        exit_code = ?status.code(),
                        artifact_ok,
                        "Render failed"
                    );
                    ExitClassification::Failure
                }
            }
            None => {
                tracing::warn!(
                    job_id = %job.id,
                    deadline_secs = deadline.as_secs(),
                    "Render exceeded its deadline, terminating process tree"
                );
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                ExitClassification::Timeout
            }
        };

        let _ = scanner.await;

        Ok(RenderResult {
            job_id: job.id.clone(),
            artifact,
            duration: start.elapsed(),
            status: classification,
        })
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Best-effort progress extraction from a renderer output line shaped
/// like `Fra:120 ... Rendered 12/64 Tiles`.
fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim_start().strip_prefix(PROGRESS_PREFIX)?;
    let fraction = rest.split_once("Rendered ")?.1;
    let (done, rest) = fraction.split_once('/')?;
    let done: u64 = done.trim().parse().ok()?;
    let total: u64 = rest.split_whitespace().next()?.parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((done * 100 / total).min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use shepherd_core::job::{AssetRef, ComputeType, FrameDescriptor};

    fn job(estimated: Duration) -> Job {
        Job {
            id: "job-1".into(),
            compute: ComputeType::CpuOnly,
            renderer: AssetRef {
                asset_id: "r".into(),
                sha256: "00".into(),
            },
            scene: AssetRef {
                asset_id: "s".into(),
                sha256: "11".into(),
            },
            frame: FrameDescriptor {
                number: 7,
                extra_args: Vec::new(),
            },
            estimated_duration: estimated,
            cpu_fallback_allowed: true,
        }
    }

    #[test]
    fn parses_tile_progress() {
        assert_eq!(parse_progress("Fra:120 Mem:1.2G | Rendered 16/64 Tiles"), Some(25));
        assert_eq!(parse_progress("Fra:1 Rendered 64/64 Tiles"), Some(100));
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert_eq!(parse_progress("Blender quit"), None);
        assert_eq!(parse_progress("Fra:1 no tiles here"), None);
        assert_eq!(parse_progress("Fra:1 Rendered x/64 Tiles"), None);
        assert_eq!(parse_progress("Fra:1 Rendered 1/0 Tiles"), None);
    }

    #[test]
    fn progress_is_capped_at_100() {
        assert_eq!(parse_progress("Fra:1 Rendered 80/64 Tiles"), Some(100));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("renderer.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Script body that resolves the `--output` argument into `$out`.
        const PARSE_OUTPUT: &str = r#"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
"#;

        fn supervisor(dir: &Path, floor: Duration) -> (RenderSupervisor, Arc<EventBus>) {
            let events = Arc::new(EventBus::default());
            let supervisor = RenderSupervisor::new(
                SupervisorConfig {
                    work_dir: dir.join("work"),
                    timeout_floor: floor,
                    safety_factor: 1.0,
                },
                ProcessLauncher::with_capability(false),
                Arc::clone(&events),
            );
            (supervisor, events)
        }

        #[tokio::test]
        async fn successful_render_produces_artifact_and_progress() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                &format!(
                    "{PARSE_OUTPUT}\necho 'Fra:7 Rendered 32/64 Tiles'\nprintf frame-data > \"$out\"\n"
                ),
            );
            let (supervisor, events) = supervisor(dir.path(), Duration::from_secs(30));
            let mut rx = events.subscribe();

            let result = supervisor
                .run(
                    &job(Duration::ZERO),
                    &Allocation::Cpu { cores: 2 },
                    &script,
                    &dir.path().join("scene"),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExitClassification::Success);
            assert_eq!(std::fs::read(&result.artifact).unwrap(), b"frame-data");

            match rx.recv().await.unwrap() {
                WorkerEvent::RenderProgress { job_id, percent } => {
                    assert_eq!(job_id, "job-1");
                    assert_eq!(percent, 50);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        #[tokio::test]
        async fn nonzero_exit_is_a_failure() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exit 2\n");
            let (supervisor, _events) = supervisor(dir.path(), Duration::from_secs(30));

            let result = supervisor
                .run(
                    &job(Duration::ZERO),
                    &Allocation::Cpu { cores: 2 },
                    &script,
                    &dir.path().join("scene"),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExitClassification::Failure);
        }

        #[tokio::test]
        async fn missing_artifact_is_a_failure_despite_clean_exit() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exit 0\n");
            let (supervisor, _events) = supervisor(dir.path(), Duration::from_secs(30));

            let result = supervisor
                .run(
                    &job(Duration::ZERO),
                    &Allocation::Cpu { cores: 2 },
                    &script,
                    &dir.path().join("scene"),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExitClassification::Failure);
        }

        #[tokio::test]
        async fn runaway_render_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "sleep 30\n");
            let (supervisor, _events) = supervisor(dir.path(), Duration::from_millis(200));

            let start = Instant::now();
            let result = supervisor
                .run(
                    &job(Duration::ZERO),
                    &Allocation::Cpu { cores: 2 },
                    &script,
                    &dir.path().join("scene"),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExitClassification::Timeout);
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn cancellation_kills_the_render() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "sleep 30\n");
            let (supervisor, _events) = supervisor(dir.path(), Duration::from_secs(60));

            let cancel = CancellationToken::new();
            let handle = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    cancel.cancel();
                })
            };

            let start = Instant::now();
            let err = supervisor
                .run(
                    &job(Duration::ZERO),
                    &Allocation::Cpu { cores: 2 },
                    &script,
                    &dir.path().join("scene"),
                    &cancel,
                )
                .await
                .unwrap_err();

            assert!(matches!(err, SupervisorError::Cancelled));
            assert!(start.elapsed() < Duration::from_secs(10));
            handle.await.unwrap();
        }
    }
}
