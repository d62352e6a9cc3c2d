//! GPU enumeration.
//!
//! Devices are discovered by shelling out to `nvidia-smi` and parsing
//! its CSV output. A machine without the tool (or without GPUs) simply
//! reports an empty list; GPU rendering is then unavailable but the
//! worker keeps running on CPU.

use std::process::Command;

use serde::Serialize;

/// A single discovered GPU, as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    /// Marketing model name, e.g. `NVIDIA GeForce RTX 3080`.
    pub model: String,
    /// Total VRAM in MiB.
    pub memory_mb: u64,
    /// Stable identifier the operator selects devices by, e.g. `CUDA_0`.
    pub identifier: String,
}

/// Enumerate the GPUs visible on this machine.
pub fn enumerate() -> Vec<GpuDevice> {
    let output = match Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::debug!(
                status = ?output.status.code(),
                "nvidia-smi exited unsuccessfully, assuming no GPUs"
            );
            return Vec::new();
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi not available, assuming no GPUs");
            return Vec::new();
        }
    };

    parse_query_output(&String::from_utf8_lossy(&output.stdout))
}

/// Find a device by its `CUDA_n` identifier or its model name.
pub fn find<'a>(devices: &'a [GpuDevice], selector: &str) -> Option<&'a GpuDevice> {
    devices
        .iter()
        .find(|d| d.identifier == selector || d.model == selector)
}

/// Parse `nvidia-smi --query-gpu=name,memory.total` CSV lines into
/// devices. Unparseable lines are skipped.
fn parse_query_output(output: &str) -> Vec<GpuDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .filter_map(|(index, line)| {
            let (name, memory) = line.rsplit_once(',')?;
            let memory_mb = memory.trim().parse().ok()?;
            Some(GpuDevice {
                model: name.trim().to_string(),
                memory_mb,
                identifier: format!("CUDA_{index}"),
            })
        })
        .collect()
}
