//! Per-thread device resource registry.
//!
//! Every thread owns one slot per device index. The first touch on a thread
//! creates a non-blocking stream for every visible device; BLAS and RNG
//! handles are created on first request and bound to the slot's stream.
//! When the thread exits, each slot is torn down RNG first, then BLAS, then
//! the stream.
//!
//! Nothing here is shared between threads, so lazy creation needs no
//! locking: two threads asking for the same device's handle each get their
//! own.

use std::cell::RefCell;

use opgraph_core::config::MAX_DEVICES;
use tracing::{debug, error};

use crate::backend::{BlasHandle, DeviceBackend, PointerMode, RngHandle, Stream};
use crate::device::DeviceGuard;
use crate::error::{CudaError, CudaResult};
use crate::runtime;

#[derive(Debug, Default, Clone, Copy)]
struct DeviceSlot {
    stream: Option<Stream>,
    blas: Option<BlasHandle>,
    rng: Option<RngHandle>,
}

struct ThreadResources {
    backend: &'static dyn DeviceBackend,
    slots: [DeviceSlot; MAX_DEVICES],
}

impl ThreadResources {
    fn new() -> CudaResult<Self> {
        let backend = runtime::backend();
        let mut resources = Self {
            backend,
            slots: [DeviceSlot::default(); MAX_DEVICES],
        };
        let count = backend.device_count().min(MAX_DEVICES);
        for device in 0..count {
            // A failure drops `resources`, destroying the streams created so far.
            let _guard = DeviceGuard::new(device)?;
            let stream = backend.create_stream(device)?;
            resources.slots[device].stream = Some(stream);
        }
        debug!(devices = count, "thread device resources created");
        Ok(resources)
    }

    fn slot(&mut self, device: usize) -> CudaResult<&mut DeviceSlot> {
        let count = self.backend.device_count().min(MAX_DEVICES);
        if device >= count {
            return Err(CudaError::InvalidDevice { device, count });
        }
        Ok(&mut self.slots[device])
    }

    fn stream(&mut self, device: usize) -> CudaResult<Stream> {
        let stream = self.slot(device)?.stream;
        stream.ok_or(CudaError::InvalidDevice {
            device,
            count: self.backend.device_count(),
        })
    }

    fn blas_handle(&mut self, device: usize) -> CudaResult<BlasHandle> {
        let stream = self.stream(device)?;
        if let Some(handle) = self.slot(device)?.blas {
            return Ok(handle);
        }

        let backend = self.backend;
        let _guard = DeviceGuard::new(device)?;
        let handle = backend.create_blas(device)?;
        let configured = backend
            .blas_set_pointer_mode(handle, PointerMode::Host)
            .and_then(|()| backend.blas_set_stream(handle, stream));
        if let Err(e) = configured {
            backend.destroy_blas(handle);
            return Err(e);
        }

        debug!(device, handle = ?handle, stream = ?stream, "created BLAS handle");
        self.slot(device)?.blas = Some(handle);
        Ok(handle)
    }

    fn rng_handle(&mut self, device: usize, seed: u64) -> CudaResult<RngHandle> {
        let stream = self.stream(device)?;
        if let Some(handle) = self.slot(device)?.rng {
            return Ok(handle);
        }

        let backend = self.backend;
        let _guard = DeviceGuard::new(device)?;
        let handle = backend.create_rng(device)?;
        let seed = seed.wrapping_add(device as u64);
        let configured = backend
            .rng_set_seed(handle, seed)
            .and_then(|()| backend.rng_set_stream(handle, stream));
        if let Err(e) = configured {
            backend.destroy_rng(handle);
            return Err(e);
        }

        debug!(device, handle = ?handle, seed, stream = ?stream, "created RNG handle");
        self.slot(device)?.rng = Some(handle);
        Ok(handle)
    }
}

impl Drop for ThreadResources {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(rng) = slot.rng.take() {
                self.backend.destroy_rng(rng);
            }
            if let Some(blas) = slot.blas.take() {
                self.backend.destroy_blas(blas);
            }
            if let Some(stream) = slot.stream.take() {
                self.backend.destroy_stream(stream);
            }
        }
    }
}

thread_local! {
    static RESOURCES: RefCell<Option<ThreadResources>> = const { RefCell::new(None) };
}

fn with_resources<T>(f: impl FnOnce(&mut ThreadResources) -> CudaResult<T>) -> CudaResult<T> {
    RESOURCES
        .try_with(|cell| {
            let mut cell = cell.borrow_mut();
            if cell.is_none() {
                *cell = Some(ThreadResources::new()?);
            }
            match cell.as_mut() {
                Some(resources) => f(resources),
                None => Err(CudaError::BackendUnavailable(
                    "thread device resources missing".to_string(),
                )),
            }
        })
        .unwrap_or_else(|_| {
            error!("device resources accessed during thread teardown");
            Err(CudaError::BackendUnavailable(
                "thread device resources already destroyed".to_string(),
            ))
        })
}

/// This thread's stream for `device`.
pub(crate) fn stream(device: usize) -> CudaResult<Stream> {
    with_resources(|r| r.stream(device))
}

/// This thread's BLAS handle for `device`, created and bound on first use.
pub(crate) fn blas_handle(device: usize) -> CudaResult<BlasHandle> {
    with_resources(|r| r.blas_handle(device))
}

/// This thread's RNG handle for `device`, created on first use and seeded
/// with `seed + device`.
pub(crate) fn rng_handle(device: usize, seed: u64) -> CudaResult<RngHandle> {
    with_resources(|r| r.rng_handle(device, seed))
}
