//! Render job domain types.
//!
//! A [`Job`] is one unit of render work assigned by the dispatch server:
//! a scene, a renderer binary at a specific version, and a frame to
//! produce. Jobs are created by the dispatch layer on a successful
//! request and destroyed once a terminal outcome (delivered or
//! permanently failed) is recorded.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::GpuDevice;

/// Server-assigned job identifier.
pub type JobId = String;

/// Which device class a job may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeType {
    CpuOnly,
    GpuOnly,
    CpuGpu,
}

impl ComputeType {
    /// Wire name used in job requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::CpuOnly => "cpu_only",
            ComputeType::GpuOnly => "gpu_only",
            ComputeType::CpuGpu => "cpu_gpu",
        }
    }
}

/// Content-addressed reference to a downloadable asset (renderer binary
/// or scene archive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Server-side asset identifier.
    pub asset_id: String,
    /// Expected SHA-256 hex digest of the asset bytes.
    pub sha256: String,
}

/// The frame a job renders and any extra renderer arguments the server
/// wants passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub number: u32,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// One unit of render work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub compute: ComputeType,
    pub renderer: AssetRef,
    pub scene: AssetRef,
    pub frame: FrameDescriptor,
    /// Server's estimate of how long the render should take.
    pub estimated_duration: Duration,
    /// Whether a combined-type job may fall back to CPU when no GPU is
    /// free.
    pub cpu_fallback_allowed: bool,
}

/// What came back from a job request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Assigned(Job),
    /// The server has nothing compatible right now; back off and ask
    /// again later.
    NoJobAvailable,
    /// The server asked the worker to slow down.
    RetryLater,
    /// Unrecoverable rejection; the engine stops.
    Fatal(String),
}

/// How a finished render subprocess is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClassification {
    /// Exit code 0 and the output artifact exists and is non-empty.
    Success,
    /// Non-zero exit or missing/empty artifact.
    Failure,
    /// The wall-clock deadline expired and the process was terminated.
    Timeout,
}

/// The product of a supervised render run.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub job_id: JobId,
    pub artifact: PathBuf,
    pub duration: Duration,
    pub status: ExitClassification,
}

impl RenderResult {
    /// Whether this result is eligible for upload. Failed and timed-out
    /// renders never enter the upload pipeline.
    pub fn uploadable(&self) -> bool {
        self.status == ExitClassification::Success
    }
}

/// A device reserved for the duration of one render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    Cpu { cores: usize },
    Gpu { device: GpuDevice },
}

/// Compute the wall-clock deadline for a render: the configured floor or
/// the server's estimate scaled by the safety factor, whichever is
/// larger.
pub fn render_deadline(estimated: Duration, floor: Duration, safety_factor: f64) -> Duration {
    let scaled = estimated.mul_f64(safety_factor);
    scaled.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_uses_floor_for_short_estimates() {
        let d = render_deadline(
            Duration::from_secs(10),
            Duration::from_secs(300),
            2.0,
        );
        assert_eq!(d, Duration::from_secs(300));
    }

    #[test]
    fn deadline_scales_long_estimates() {
        let d = render_deadline(
            Duration::from_secs(600),
            Duration::from_secs(300),
            1.5,
        );
        assert_eq!(d, Duration::from_secs(900));
    }

    #[test]
    fn failed_results_are_not_uploadable() {
        for (status, expected) in [
            (ExitClassification::Success, true),
            (ExitClassification::Failure, false),
            (ExitClassification::Timeout, false),
        ] {
            let result = RenderResult {
                job_id: "j-1".into(),
                artifact: PathBuf::from("/tmp/j-1.frame"),
                duration: Duration::from_secs(1),
                status,
            };
            assert_eq!(result.uploadable(), expected);
        }
    }

    #[test]
    fn compute_type_wire_names() {
        assert_eq!(ComputeType::CpuOnly.as_str(), "cpu_only");
        assert_eq!(ComputeType::GpuOnly.as_str(), "gpu_only");
        assert_eq!(ComputeType::CpuGpu.as_str(), "cpu_gpu");
    }
}
