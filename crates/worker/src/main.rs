//! `shepherd-worker` -- render-farm worker binary.
//!
//! Loads the configuration, probes the local hardware, wires the
//! dispatch client and work engine together, and runs until a
//! termination signal or a fatal server rejection.
//!
//! # Environment variables
//!
//! | Variable                       | Required | Default   | Description                              |
//! |--------------------------------|----------|-----------|------------------------------------------|
//! | `SHEPHERD_SERVER_URL`          | yes      | --        | Base URL of the dispatch server          |
//! | `SHEPHERD_LOGIN`               | yes      | --        | Worker account login                     |
//! | `SHEPHERD_PASSWORD`            | yes      | --        | Worker account password                  |
//! | `SHEPHERD_COMPUTE_METHOD`      | no       | `cpu_gpu` | `cpu`, `gpu`, or `cpu_gpu`               |
//! | `SHEPHERD_GPU`                 | if gpu   | --        | Device selector, `CUDA_n` or model name  |
//! | `SHEPHERD_CORES`               | no       | all       | CPU threads handed to a render           |
//! | `SHEPHERD_CACHE_DIR`           | no       | `cache`   | Asset cache directory                    |
//! | `SHEPHERD_CACHE_MAX_BYTES`     | no       | 10 GiB    | Asset cache byte budget                  |
//! | `SHEPHERD_MAX_UPLOADS`         | no       | `1`       | Concurrent result uploads                |
//! | `SHEPHERD_REQUEST_WINDOWS`     | no       | always    | `HH:MM-HH:MM[,...]` fetch windows        |
//! | `SHEPHERD_SHUTDOWN_GRACE_SECS` | no       | `1800`    | Grace period for an in-flight render     |
//!
//! Signals: SIGINT/SIGTERM request a graceful stop; SIGUSR1 suspends
//! job intake and SIGUSR2 resumes it (Unix).

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shepherd_core::config::Config;
use shepherd_core::hardware::{gpu, HardwareSummary, ProcessLauncher};
use shepherd_core::job::ComputeType;
use shepherd_dispatch::{DispatchApi, DispatchService, SessionManager};
use shepherd_engine::WorkEngine;
use shepherd_events::EventBus;

mod console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "console=info,shepherd_worker=info,shepherd_engine=info,\
                 shepherd_dispatch=info,shepherd_cache=info,shepherd_core=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = Arc::new(Config::from_env().context("Invalid worker configuration")?);
    tracing::info!(
        server = %config.server_url,
        compute = config.compute.as_str(),
        cores = config.cpu_cores,
        "Loaded worker configuration"
    );

    // --- Hardware ---
    let hardware = HardwareSummary::collect();
    tracing::info!(
        cpu = %hardware.cpu_model,
        cores = hardware.cores,
        gpus = hardware.gpus.len(),
        "Hardware probe complete"
    );

    let gpu_device = if config.compute == ComputeType::CpuOnly {
        None
    } else {
        // Config validation guarantees a selector is present here.
        let selector = config.gpu_selector.as_deref().unwrap_or_default();
        match gpu::find(&hardware.gpus, selector) {
            Some(device) => {
                tracing::info!(model = %device.model, identifier = %device.identifier, "GPU selected");
                Some(device.clone())
            }
            None => anyhow::bail!(
                "GPU selector '{selector}' matches none of the detected devices"
            ),
        }
    };

    let launcher = ProcessLauncher::detect();

    // --- Event bus + console front-end ---
    let events = Arc::new(EventBus::default());
    let console = tokio::spawn(console::run(events.subscribe()));

    // --- Dispatch client ---
    let service: Arc<dyn DispatchService> = Arc::new(DispatchApi::new(
        config.server_url.clone(),
        config.login.clone(),
        config.password.clone(),
    ));
    let session = SessionManager::new(Arc::clone(&service), hardware, Arc::clone(&events));

    // --- Engine ---
    let engine = WorkEngine::new(
        Arc::clone(&config),
        gpu_device,
        service,
        session,
        launcher,
        Arc::clone(&events),
    )?;

    #[cfg(unix)]
    spawn_pause_signals(Arc::clone(&engine));

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            shutdown_signal().await;
            engine.shutdown();
        });
    }

    let outcome = engine.run().await;
    console.abort();

    if let Err(e) = &outcome {
        tracing::error!(error = %e, "Worker stopped on a fatal error");
    }
    Ok(outcome?)
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the worker
/// stops cleanly whether interrupted interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// SIGUSR1 suspends job intake, SIGUSR2 resumes it. A render already
/// in flight finishes either way.
#[cfg(unix)]
fn spawn_pause_signals(engine: Arc<WorkEngine>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut pause =
            signal(SignalKind::user_defined1()).expect("Failed to install SIGUSR1 handler");
        let mut resume =
            signal(SignalKind::user_defined2()).expect("Failed to install SIGUSR2 handler");
        loop {
            tokio::select! {
                _ = pause.recv() => engine.pause(),
                _ = resume.recv() => engine.resume(),
            }
        }
    });
}
