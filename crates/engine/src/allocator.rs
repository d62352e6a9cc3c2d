//! Device arbitration.
//!
//! One pool, one lock, short critical sections. A GPU is exclusive:
//! zero or one outstanding allocation. CPU allocations take the
//! configured core count out of the budget, so a second CPU render
//! cannot start while the first holds the cores.

use std::sync::Mutex;

use shepherd_core::hardware::GpuDevice;
use shepherd_core::job::{Allocation, ComputeType};

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("No compatible device available")]
    NoCompatibleDevice,
}

struct Pool {
    cpu_cores: usize,
    cpu_available: usize,
    gpu: Option<GpuDevice>,
    gpu_busy: bool,
}

/// Assigns a device to each job consistent with the configured compute
/// method.
pub struct HardwareAllocator {
    pool: Mutex<Pool>,
}

impl HardwareAllocator {
    /// `cpu_cores` is both the budget and the size of one CPU
    /// allocation; `gpu` is the operator-selected device, if any.
    pub fn new(cpu_cores: usize, gpu: Option<GpuDevice>) -> Self {
        Self {
            pool: Mutex::new(Pool {
                cpu_cores,
                cpu_available: cpu_cores,
                gpu,
                gpu_busy: false,
            }),
        }
    }

    /// Reserve a device for one render.
    ///
    /// `GpuOnly` needs the configured GPU free; `CpuOnly` takes the
    /// configured cores; `CpuGpu` prefers the GPU and falls back to CPU
    /// only when the job permits it.
    pub fn acquire(
        &self,
        compute: ComputeType,
        cpu_fallback_allowed: bool,
    ) -> Result<Allocation, AllocatorError> {
        let mut pool = self.pool.lock().expect("allocator pool poisoned");

        match compute {
            ComputeType::CpuOnly => Self::acquire_cpu(&mut pool),
            ComputeType::GpuOnly => Self::acquire_gpu(&mut pool),
            ComputeType::CpuGpu => Self::acquire_gpu(&mut pool).or_else(|_| {
                if cpu_fallback_allowed {
                    Self::acquire_cpu(&mut pool)
                } else {
                    Err(AllocatorError::NoCompatibleDevice)
                }
            }),
        }
    }

    /// Whether a device that could serve `compute` is currently free.
    /// The engine uses this to gate fetching; only render tasks ever
    /// take devices, so a positive answer cannot be invalidated by
    /// anything but the caller's own acquire.
    pub fn has_capacity(&self, compute: ComputeType) -> bool {
        let pool = self.pool.lock().expect("allocator pool poisoned");
        let cpu_free = pool.cpu_available >= pool.cpu_cores;
        let gpu_free = pool.gpu.is_some() && !pool.gpu_busy;
        match compute {
            ComputeType::CpuOnly => cpu_free,
            ComputeType::GpuOnly => gpu_free,
            ComputeType::CpuGpu => cpu_free || gpu_free,
        }
    }

    /// Return a device to the free pool.
    pub fn release(&self, allocation: &Allocation) {
        let mut pool = self.pool.lock().expect("allocator pool poisoned");
        match allocation {
            Allocation::Cpu { cores } => {
                pool.cpu_available = (pool.cpu_available + cores).min(pool.cpu_cores);
            }
            Allocation::Gpu { .. } => {
                pool.gpu_busy = false;
            }
        }
    }

    fn acquire_cpu(pool: &mut Pool) -> Result<Allocation, AllocatorError> {
        if pool.cpu_available < pool.cpu_cores {
            return Err(AllocatorError::NoCompatibleDevice);
        }
        pool.cpu_available -= pool.cpu_cores;
        Ok(Allocation::Cpu {
            cores: pool.cpu_cores,
        })
    }

    fn acquire_gpu(pool: &mut Pool) -> Result<Allocation, AllocatorError> {
        match &pool.gpu {
            Some(device) if !pool.gpu_busy => {
                pool.gpu_busy = true;
                Ok(Allocation::Gpu {
                    device: device.clone(),
                })
            }
            _ => Err(AllocatorError::NoCompatibleDevice),
        }
    }
}
