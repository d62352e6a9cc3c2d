//! Worker configuration.
//!
//! The configuration is read once at startup (environment variables,
//! optionally via a `.env` file loaded by the binary) into an immutable
//! [`Config`] value that is passed by reference into every component.
//! Nothing mutates it afterwards.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;
use crate::job::ComputeType;
use crate::window::{parse_windows, RequestWindow};

/// Environment variable prefix for all worker settings.
const ENV_PREFIX: &str = "SHEPHERD_";

/// Immutable, validated worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the dispatch server.
    pub server_url: String,
    pub login: String,
    pub password: String,

    /// Which device class this worker offers.
    pub compute: ComputeType,
    /// Operator's device selector, `CUDA_n` or a model name. Required
    /// when `compute` involves the GPU.
    pub gpu_selector: Option<String>,
    /// CPU threads handed to a CPU render.
    pub cpu_cores: usize,

    /// Root of the on-disk asset cache.
    pub cache_dir: PathBuf,
    /// Byte budget for the asset cache.
    pub cache_max_bytes: u64,
    /// Scratch directory for render output.
    pub work_dir: PathBuf,

    /// Maximum concurrent result uploads (also the enqueue backpressure
    /// bound).
    pub max_concurrent_uploads: usize,
    /// Attempts per result upload before it is dropped.
    pub upload_max_attempts: u32,
    /// Attempts per asset download before the job fails.
    pub download_max_attempts: u32,

    /// Time-of-day windows during which job requests may be made.
    /// Empty means always.
    pub request_windows: Vec<RequestWindow>,

    /// Minimum render deadline regardless of the server's estimate.
    pub render_timeout_floor: Duration,
    /// Multiplier applied to the server's duration estimate.
    pub render_safety_factor: f64,

    /// How long a graceful shutdown waits for an in-flight render.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Build a configuration from `SHEPHERD_*` environment variables and
    /// validate it.
    pub fn from_env() -> Result<Self, CoreError> {
        let config = Self {
            server_url: require("SERVER_URL")?,
            login: require("LOGIN")?,
            password: require("PASSWORD")?,
            compute: parse_compute(&optional("COMPUTE_METHOD").unwrap_or_else(|| "cpu_gpu".into()))?,
            gpu_selector: optional("GPU"),
            cpu_cores: parse_var("CORES", default_cores())?,
            cache_dir: PathBuf::from(optional("CACHE_DIR").unwrap_or_else(|| "cache".into())),
            cache_max_bytes: parse_var("CACHE_MAX_BYTES", 10 * 1024 * 1024 * 1024)?,
            work_dir: PathBuf::from(optional("WORK_DIR").unwrap_or_else(|| "work".into())),
            max_concurrent_uploads: parse_var("MAX_UPLOADS", 1)?,
            upload_max_attempts: parse_var("UPLOAD_MAX_ATTEMPTS", 5)?,
            download_max_attempts: parse_var("DOWNLOAD_MAX_ATTEMPTS", 3)?,
            request_windows: parse_windows(&optional("REQUEST_WINDOWS").unwrap_or_default())?,
            render_timeout_floor: Duration::from_secs(parse_var(
                "RENDER_TIMEOUT_FLOOR_SECS",
                600,
            )?),
            render_safety_factor: parse_var("RENDER_SAFETY_FACTOR", 3.0)?,
            shutdown_grace: Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECS", 1800)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules. Returns the first violation found.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(CoreError::Validation(format!(
                "Server URL must start with http:// or https://, got '{}'",
                self.server_url
            )));
        }
        if self.login.is_empty() {
            return Err(CoreError::Validation("Login must not be empty".into()));
        }
        if self.cpu_cores == 0 {
            return Err(CoreError::Validation("Core count must be at least 1".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(CoreError::Validation(
                "Max concurrent uploads must be at least 1".into(),
            ));
        }
        if self.upload_max_attempts == 0 || self.download_max_attempts == 0 {
            return Err(CoreError::Validation(
                "Retry attempt counts must be at least 1".into(),
            ));
        }
        if self.cache_max_bytes == 0 {
            return Err(CoreError::Validation(
                "Cache size budget must be greater than zero".into(),
            ));
        }
        if self.render_safety_factor < 1.0 {
            return Err(CoreError::Validation(
                "Render safety factor must be at least 1.0".into(),
            ));
        }
        if self.compute != ComputeType::CpuOnly {
            match &self.gpu_selector {
                None => {
                    return Err(CoreError::Validation(format!(
                        "Compute method {} requires a GPU selector",
                        self.compute.as_str()
                    )))
                }
                Some(selector) => validate_gpu_selector(selector)?,
            }
        }
        Ok(())
    }
}

/// A selector is either `CUDA_<n>` or a free-form model name.
fn validate_gpu_selector(selector: &str) -> Result<(), CoreError> {
    if selector.is_empty() {
        return Err(CoreError::Validation("GPU selector must not be empty".into()));
    }
    if let Some(suffix) = selector.strip_prefix("CUDA_") {
        if suffix.parse::<u32>().is_err() {
            return Err(CoreError::Validation(format!(
                "GPU selector '{selector}' should look like 'CUDA_N' where N is a number"
            )));
        }
    }
    Ok(())
}

fn default_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_compute(value: &str) -> Result<ComputeType, CoreError> {
    match value.to_ascii_lowercase().as_str() {
        "cpu" | "cpu_only" => Ok(ComputeType::CpuOnly),
        "gpu" | "gpu_only" => Ok(ComputeType::GpuOnly),
        "cpu_gpu" | "gpu_cpu" => Ok(ComputeType::CpuGpu),
        other => Err(CoreError::Validation(format!(
            "Unknown compute method '{other}', expected cpu, gpu, or cpu_gpu"
        ))),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn require(name: &str) -> Result<String, CoreError> {
    optional(name)
        .ok_or_else(|| CoreError::Validation(format!("{ENV_PREFIX}{name} must be set")))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, CoreError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            CoreError::Validation(format!("{ENV_PREFIX}{name} has an invalid value: '{raw}'"))
        }),
    }
}
