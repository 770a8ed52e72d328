//! Active-device scoping and memory-space markers.

use std::marker::PhantomData;

use tracing::warn;

use crate::backend::MemcpyKind;
use crate::error::CudaResult;
use crate::runtime;

/// Makes a device active for its lifetime and restores the previously
/// active device on drop.
///
/// Restoring never panics; a failure is logged.
#[derive(Debug)]
pub struct DeviceGuard {
    previous: usize,
    _thread: PhantomData<*const ()>,
}

impl DeviceGuard {
    /// # Errors
    ///
    /// `CudaError::InvalidDevice` if `device` is not visible, or the
    /// backend's error if the active device cannot be queried or changed.
    pub fn new(device: usize) -> CudaResult<Self> {
        let backend = runtime::backend();
        let previous = backend.current_device()?;
        if previous != device {
            backend.set_device(device)?;
        }
        Ok(Self {
            previous,
            _thread: PhantomData,
        })
    }

    /// Device that will be restored on drop.
    pub fn previous(&self) -> usize {
        self.previous
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let backend = runtime::backend();
        match backend.current_device() {
            Ok(current) if current == self.previous => {}
            _ => {
                if let Err(e) = backend.set_device(self.previous) {
                    warn!(device = self.previous, error = %e, "failed to restore active device");
                }
            }
        }
    }
}

/// Which side of the bus a buffer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device,
}

mod sealed {
    pub trait Sealed {}
}

/// Type-level memory location used to parameterize copies.
pub trait MemorySpace: sealed::Sealed {
    const LOCATION: Location;
}

/// Host (pageable or pinned) memory.
#[derive(Debug, Clone, Copy)]
pub enum Host {}

/// Device memory.
#[derive(Debug, Clone, Copy)]
pub enum Device {}

impl sealed::Sealed for Host {}
impl sealed::Sealed for Device {}

impl MemorySpace for Host {
    const LOCATION: Location = Location::Host;
}

impl MemorySpace for Device {
    const LOCATION: Location = Location::Device;
}

/// Copy direction for a source and destination location.
pub fn memcpy_kind(src: Location, dst: Location) -> MemcpyKind {
    match (src, dst) {
        (Location::Host, Location::Host) => MemcpyKind::HostToHost,
        (Location::Host, Location::Device) => MemcpyKind::HostToDevice,
        (Location::Device, Location::Host) => MemcpyKind::DeviceToHost,
        (Location::Device, Location::Device) => MemcpyKind::DeviceToDevice,
    }
}
