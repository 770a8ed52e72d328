//! Process-wide device runtime state.
//!
//! One backend and one device memory pool serve the whole process. Both are
//! installed either explicitly through [`init`] or lazily on first use with
//! defaults: the CUDA backend when compiled in and a device is visible, the
//! simulated backend otherwise.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use opgraph_core::config::MAX_DEVICES;
use opgraph_core::{BackendKind, DeviceConfig, MemoryConfig, RuntimeConfig, SyncFailurePolicy};
use tracing::info;

use crate::backend::{DeviceBackend, SimulatedBackend};
use crate::error::{CudaError, CudaResult};
use crate::memory_pool::MemoryPool;

static BACKEND: OnceLock<Arc<dyn DeviceBackend>> = OnceLock::new();
static MEMORY_POOL: OnceLock<MemoryPool> = OnceLock::new();
static DEFAULT_DEVICE: AtomicUsize = AtomicUsize::new(0);
static SYNC_FAILURE: AtomicU8 = AtomicU8::new(POLICY_ABORT);

const POLICY_ABORT: u8 = 0;
const POLICY_PANIC: u8 = 1;

/// Install the backend, memory pool and device defaults from `config`.
///
/// Must run before anything touches a device.
///
/// # Errors
///
/// - `CudaError::Core` if `config` fails validation
/// - `CudaError::BackendUnavailable` if `backend = "cuda"` without the `cuda` feature
/// - `CudaError::InvalidDevice` if `default_device` is not visible
/// - `CudaError::AlreadyInitialized` if a backend or pool is already installed
pub fn init(config: &RuntimeConfig) -> CudaResult<()> {
    config.validate()?;
    if BACKEND.get().is_some() || MEMORY_POOL.get().is_some() {
        return Err(CudaError::AlreadyInitialized);
    }

    let backend = build_backend(&config.device)?;
    let count = backend.device_count();
    if config.device.default_device >= count {
        return Err(CudaError::InvalidDevice {
            device: config.device.default_device,
            count,
        });
    }

    BACKEND
        .set(Arc::clone(&backend))
        .map_err(|_| CudaError::AlreadyInitialized)?;
    MEMORY_POOL
        .set(MemoryPool::new(backend, config.memory.clone()))
        .map_err(|_| CudaError::AlreadyInitialized)?;
    DEFAULT_DEVICE.store(config.device.default_device, Ordering::Release);
    set_sync_failure_policy(config.device.sync_failure);

    info!(
        backend = backend_name(),
        device_count = count,
        default_device = config.device.default_device,
        caching = config.memory.caching,
        "device runtime initialized"
    );
    Ok(())
}

fn build_backend(config: &DeviceConfig) -> CudaResult<Arc<dyn DeviceBackend>> {
    match config.backend {
        BackendKind::Simulated => Ok(simulated(config)),
        BackendKind::Cuda => cuda_backend(),
        BackendKind::Auto => Ok(cuda_backend().unwrap_or_else(|e| {
            info!(reason = %e, "CUDA backend unavailable, using simulated devices");
            simulated(config)
        })),
    }
}

fn simulated(config: &DeviceConfig) -> Arc<dyn DeviceBackend> {
    Arc::new(SimulatedBackend::new(
        config.simulated_devices,
        config.simulated_memory_bytes,
    ))
}

#[cfg(feature = "cuda")]
fn cuda_backend() -> CudaResult<Arc<dyn DeviceBackend>> {
    Ok(Arc::new(crate::backend::CudaBackend::new()?))
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend() -> CudaResult<Arc<dyn DeviceBackend>> {
    Err(CudaError::BackendUnavailable(
        "built without the `cuda` feature".to_string(),
    ))
}

fn backend_arc() -> &'static Arc<dyn DeviceBackend> {
    BACKEND.get_or_init(|| {
        let config = DeviceConfig::default();
        match build_backend(&config) {
            Ok(backend) => backend,
            Err(_) => simulated(&config),
        }
    })
}

/// The process-wide device backend.
pub fn backend() -> &'static dyn DeviceBackend {
    backend_arc().as_ref()
}

fn backend_name() -> &'static str {
    backend().name()
}

/// The simulated backend, when it is the one installed.
pub fn simulated_backend() -> Option<&'static SimulatedBackend> {
    backend().as_any().downcast_ref::<SimulatedBackend>()
}

/// The process-wide device memory pool.
pub fn memory_pool() -> &'static MemoryPool {
    MEMORY_POOL
        .get_or_init(|| MemoryPool::new(Arc::clone(backend_arc()), MemoryConfig::default()))
}

/// Number of addressable devices, never more than [`MAX_DEVICES`].
pub fn device_count() -> usize {
    backend().device_count().min(MAX_DEVICES)
}

/// Device used by contexts that do not name one.
pub fn default_device() -> usize {
    DEFAULT_DEVICE.load(Ordering::Acquire)
}

/// # Errors
///
/// `CudaError::InvalidDevice` if `device` is not visible.
pub fn set_default_device(device: usize) -> CudaResult<()> {
    let count = device_count();
    if device >= count {
        return Err(CudaError::InvalidDevice { device, count });
    }
    DEFAULT_DEVICE.store(device, Ordering::Release);
    Ok(())
}

/// What a context does when synchronization fails while it is dropped.
pub fn sync_failure_policy() -> SyncFailurePolicy {
    match SYNC_FAILURE.load(Ordering::Acquire) {
        POLICY_PANIC => SyncFailurePolicy::Panic,
        _ => SyncFailurePolicy::Abort,
    }
}

pub fn set_sync_failure_policy(policy: SyncFailurePolicy) {
    let raw = match policy {
        SyncFailurePolicy::Abort => POLICY_ABORT,
        SyncFailurePolicy::Panic => POLICY_PANIC,
    };
    SYNC_FAILURE.store(raw, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_backend_is_simulated_without_cuda() {
        if cfg!(feature = "cuda") {
            return;
        }
        assert_eq!(backend().name(), "simulated");
        assert!(simulated_backend().is_some());
        assert_eq!(device_count(), DeviceConfig::default().simulated_devices);
    }

    #[test]
    fn test_init_after_lazy_use_is_rejected() {
        let _ = memory_pool();
        let err = init(&RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, CudaError::AlreadyInitialized));
    }

    #[test]
    fn test_set_default_device_out_of_range() {
        let err = set_default_device(device_count()).unwrap_err();
        assert!(matches!(err, CudaError::InvalidDevice { .. }));
    }

    #[test]
    fn test_build_backend_cuda_without_feature() {
        if cfg!(feature = "cuda") {
            return;
        }
        let config = DeviceConfig {
            backend: BackendKind::Cuda,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            build_backend(&config),
            Err(CudaError::BackendUnavailable(_))
        ));
    }
}
