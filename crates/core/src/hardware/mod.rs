//! Hardware capabilities consumed by the engine.
//!
//! Two flat capabilities live here: device enumeration (what GPUs and
//! CPU does this machine have) and low-priority subprocess launch. All
//! platform-conditional code is confined to this module so the engine
//! only ever sees plain data and one `command` method.

pub mod gpu;
pub mod launcher;

pub use gpu::GpuDevice;
pub use launcher::ProcessLauncher;

use serde::Serialize;

/// Flat machine description pushed to the server on authentication.
#[derive(Debug, Clone, Serialize)]
pub struct HardwareSummary {
    pub cpu_model: String,
    pub cores: usize,
    pub total_memory_kb: u64,
    pub gpus: Vec<GpuDevice>,
}

impl HardwareSummary {
    /// Probe the local machine. Failures degrade to `"unknown"` fields
    /// rather than erroring; the summary is informational.
    pub fn collect() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            cpu_model: cpu_model(),
            cores,
            total_memory_kb: total_memory_kb(),
            gpus: gpu::enumerate(),
        }
    }
}

#[cfg(target_os = "linux")]
fn cpu_model() -> String {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(content) => content
            .lines()
            .find(|line| line.starts_with("model name"))
            .and_then(|line| line.split_once(':'))
            .map(|(_, name)| name.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(not(target_os = "linux"))]
fn cpu_model() -> String {
    "unknown".to_string()
}

#[cfg(target_os = "linux")]
fn total_memory_kb() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse().ok())
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_memory_kb() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_reports_at_least_one_core() {
        let summary = HardwareSummary::collect();
        assert!(summary.cores >= 1);
        assert!(!summary.cpu_model.is_empty());
    }
}
