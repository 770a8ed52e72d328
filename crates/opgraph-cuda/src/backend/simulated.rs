//! In-process simulated devices.
//!
//! Device memory is host memory tagged with a device index, so every
//! transfer path can run (and be checked) without a GPU. The simulation is
//! strict where real hardware would corrupt memory silently:
//!
//! - device-side ranges of a copy must lie inside one live allocation
//! - host-side ranges must not point into device allocations
//! - handles are validated on every call
//!
//! Work executes eagerly at enqueue time, in issue order; each stream counts
//! the operations enqueued since its last synchronize. Asynchronous errors
//! live in a per-thread slot, as with the CUDA runtime's last-error state,
//! and can be injected with [`SimulatedBackend::inject_fault`].

use std::alloc::{self, Layout};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use opgraph_core::config::MAX_DEVICES;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use super::{BlasHandle, DeviceBackend, DeviceFault, MemcpyKind, PointerMode, RngHandle, Stream};
use crate::error::{CudaError, CudaResult};

/// Alignment of simulated device and pinned allocations.
const SIM_ALIGNMENT: usize = 256;

/// First raw handle value; handles step by 0x10 so they read like addresses.
const FIRST_HANDLE: usize = 0x1000;

/// Status code reported for simulated invalid-value failures.
const SIM_ERROR_INVALID_VALUE: i32 = 1;

thread_local! {
    static LAST_ERROR: RefCell<Option<DeviceFault>> = const { RefCell::new(None) };
}

/// Snapshot of a simulated BLAS handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasInfo {
    pub device: usize,
    pub pointer_mode: PointerMode,
    /// Raw value of the bound stream.
    pub stream: Option<usize>,
}

/// Snapshot of a simulated RNG handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngInfo {
    pub device: usize,
    pub seed: u64,
    /// Raw value of the bound stream.
    pub stream: Option<usize>,
}

#[derive(Debug)]
struct SimStream {
    device: usize,
    pending: usize,
}

#[derive(Debug)]
struct SimBlas {
    device: usize,
    pointer_mode: PointerMode,
    stream: Option<usize>,
}

#[derive(Debug)]
struct SimRng {
    device: usize,
    seed: u64,
    stream: Option<usize>,
    generator: ChaCha8Rng,
}

#[derive(Debug)]
struct SimAllocation {
    device: usize,
    layout: Layout,
}

#[derive(Debug, Default)]
struct SimState {
    streams: HashMap<usize, SimStream>,
    blas: HashMap<usize, SimBlas>,
    rngs: HashMap<usize, SimRng>,
    /// Base address → allocation, ordered for interior-pointer lookup.
    device_memory: BTreeMap<usize, SimAllocation>,
    host_memory: HashMap<usize, Layout>,
    used_bytes: Vec<usize>,
}

impl SimState {
    /// Device owning `[addr, addr + len)`, if the range lies inside one allocation.
    fn device_range(&self, addr: usize, len: usize) -> Option<usize> {
        let (base, allocation) = self.device_memory.range(..=addr).next_back()?;
        let end = base.checked_add(allocation.layout.size())?;
        let req_end = addr.checked_add(len)?;
        (req_end <= end).then_some(allocation.device)
    }

    /// Whether any byte of `[addr, addr + len)` is device memory.
    fn overlaps_device(&self, addr: usize, len: usize) -> bool {
        let end = addr.saturating_add(len.max(1));
        self.device_memory
            .range(..end)
            .next_back()
            .is_some_and(|(base, allocation)| base + allocation.layout.size() > addr)
    }

    fn check_stream(&mut self, stream: Stream) -> CudaResult<&mut SimStream> {
        self.streams
            .get_mut(&stream.raw())
            .ok_or(CudaError::InvalidHandle {
                kind: Stream::KIND,
                raw: stream.raw(),
            })
    }

    fn check_device_range(&self, addr: usize, len: usize, what: &str) -> CudaResult<usize> {
        self.device_range(addr, len).ok_or_else(|| {
            CudaError::InvalidAccess(format!(
                "{} range {:#x}..+{} is not inside a live device allocation",
                what, addr, len
            ))
        })
    }

    fn check_host_range(&self, addr: usize, len: usize, what: &str) -> CudaResult<()> {
        if addr == 0 {
            return Err(CudaError::InvalidAccess(format!("{} host pointer is null", what)));
        }
        if self.overlaps_device(addr, len) {
            return Err(CudaError::InvalidAccess(format!(
                "{} range {:#x}..+{} is device memory, not host memory",
                what, addr, len
            )));
        }
        Ok(())
    }

    fn bump_pending(&mut self, stream: Option<usize>) {
        if let Some(s) = stream.and_then(|raw| self.streams.get_mut(&raw)) {
            s.pending += 1;
        }
    }
}

/// Simulated multi-device backend.
///
/// # Example
///
/// ```
/// use opgraph_cuda::backend::{DeviceBackend, SimulatedBackend};
///
/// let backend = SimulatedBackend::new(2, 1 << 20);
/// assert_eq!(backend.device_count(), 2);
/// let stream = backend.create_stream(1).unwrap();
/// assert_eq!(backend.stream_device(stream.raw()), Some(1));
/// backend.destroy_stream(stream);
/// ```
#[derive(Debug)]
pub struct SimulatedBackend {
    device_count: usize,
    capacity: usize,
    current_device: AtomicUsize,
    next_handle: AtomicUsize,
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    /// Backend exposing `device_count` devices of `capacity` bytes each.
    ///
    /// At most [`MAX_DEVICES`] devices are exposed.
    pub fn new(device_count: usize, capacity: usize) -> Self {
        if device_count > MAX_DEVICES {
            warn!(device_count, max = MAX_DEVICES, "capping simulated device count");
        }
        let device_count = device_count.min(MAX_DEVICES);
        Self {
            device_count,
            capacity,
            current_device: AtomicUsize::new(0),
            next_handle: AtomicUsize::new(FIRST_HANDLE),
            state: Mutex::new(SimState {
                used_bytes: vec![0; device_count],
                ..SimState::default()
            }),
        }
    }

    /// Record an asynchronous error for the calling thread; the next
    /// synchronize on this thread observes it.
    pub fn inject_fault(&self, code: i32, message: impl Into<String>) {
        let fault = DeviceFault {
            code,
            message: message.into(),
        };
        debug!(code, message = %fault.message, "injecting simulated device fault");
        LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(fault));
    }

    /// Operations enqueued on a stream since its last synchronize.
    pub fn pending_ops(&self, stream_raw: usize) -> Option<usize> {
        self.state.lock().streams.get(&stream_raw).map(|s| s.pending)
    }

    pub fn stream_device(&self, stream_raw: usize) -> Option<usize> {
        self.state.lock().streams.get(&stream_raw).map(|s| s.device)
    }

    pub fn stream_exists(&self, stream_raw: usize) -> bool {
        self.state.lock().streams.contains_key(&stream_raw)
    }

    pub fn blas_info(&self, handle_raw: usize) -> Option<BlasInfo> {
        self.state.lock().blas.get(&handle_raw).map(|b| BlasInfo {
            device: b.device,
            pointer_mode: b.pointer_mode,
            stream: b.stream,
        })
    }

    pub fn rng_info(&self, handle_raw: usize) -> Option<RngInfo> {
        self.state.lock().rngs.get(&handle_raw).map(|r| RngInfo {
            device: r.device,
            seed: r.seed,
            stream: r.stream,
        })
    }

    /// Bytes currently allocated on `device`.
    pub fn bytes_in_use(&self, device: usize) -> usize {
        self.state.lock().used_bytes.get(device).copied().unwrap_or(0)
    }

    /// Per-device capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_raw(&self) -> usize {
        self.next_handle.fetch_add(0x10, Ordering::Relaxed)
    }

    fn check_device(&self, device: usize) -> CudaResult<()> {
        if device >= self.device_count {
            return Err(CudaError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    fn allocate_on(&self, device: usize, nbytes: usize) -> CudaResult<*mut u8> {
        let mut state = self.state.lock();
        let used = state.used_bytes[device];
        let available = self.capacity.saturating_sub(used);
        if nbytes > available {
            return Err(CudaError::OutOfMemory {
                device,
                requested: nbytes,
                available,
            });
        }
        let layout = Layout::from_size_align(nbytes, SIM_ALIGNMENT).map_err(|e| CudaError::Api {
            call: "malloc",
            code: SIM_ERROR_INVALID_VALUE,
            message: e.to_string(),
        })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CudaError::OutOfMemory {
                device,
                requested: nbytes,
                available,
            });
        }
        state.used_bytes[device] += nbytes;
        state
            .device_memory
            .insert(ptr as usize, SimAllocation { device, layout });
        Ok(ptr)
    }
}

fn invalid_handle<T>(kind: &'static str, raw: usize) -> CudaResult<T> {
    Err(CudaError::InvalidHandle { kind, raw })
}

impl DeviceBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device: usize) -> CudaResult<()> {
        self.check_device(device)?;
        self.current_device.store(device, Ordering::Release);
        Ok(())
    }

    fn current_device(&self) -> CudaResult<usize> {
        Ok(self.current_device.load(Ordering::Acquire))
    }

    fn create_stream(&self, device: usize) -> CudaResult<Stream> {
        self.check_device(device)?;
        let raw = self.next_raw();
        self.state
            .lock()
            .streams
            .insert(raw, SimStream { device, pending: 0 });
        Ok(Stream::from_raw(raw))
    }

    fn destroy_stream(&self, stream: Stream) {
        if self.state.lock().streams.remove(&stream.raw()).is_none() {
            warn!(stream = ?stream, "destroying unknown simulated stream");
        }
    }

    fn stream_synchronize(&self, stream: Stream) -> CudaResult<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?.pending = 0;
        Ok(())
    }

    fn take_last_error(&self) -> Option<DeviceFault> {
        LAST_ERROR.with(|slot| slot.borrow_mut().take())
    }

    fn create_blas(&self, device: usize) -> CudaResult<BlasHandle> {
        self.check_device(device)?;
        let raw = self.next_raw();
        self.state.lock().blas.insert(
            raw,
            SimBlas {
                device,
                pointer_mode: PointerMode::Host,
                stream: None,
            },
        );
        Ok(BlasHandle::from_raw(raw))
    }

    fn blas_set_pointer_mode(&self, handle: BlasHandle, mode: PointerMode) -> CudaResult<()> {
        match self.state.lock().blas.get_mut(&handle.raw()) {
            Some(blas) => {
                blas.pointer_mode = mode;
                Ok(())
            }
            None => invalid_handle(BlasHandle::KIND, handle.raw()),
        }
    }

    fn blas_set_stream(&self, handle: BlasHandle, stream: Stream) -> CudaResult<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        match state.blas.get_mut(&handle.raw()) {
            Some(blas) => {
                blas.stream = Some(stream.raw());
                Ok(())
            }
            None => invalid_handle(BlasHandle::KIND, handle.raw()),
        }
    }

    fn destroy_blas(&self, handle: BlasHandle) {
        if self.state.lock().blas.remove(&handle.raw()).is_none() {
            warn!(handle = ?handle, "destroying unknown simulated BLAS handle");
        }
    }

    unsafe fn saxpy(
        &self,
        handle: BlasHandle,
        n: usize,
        alpha: f32,
        x: *const f32,
        y: *mut f32,
    ) -> CudaResult<()> {
        let mut state = self.state.lock();
        let stream = match state.blas.get(&handle.raw()) {
            Some(blas) if blas.pointer_mode == PointerMode::Host => blas.stream,
            Some(_) => {
                return Err(CudaError::Api {
                    call: "saxpy",
                    code: SIM_ERROR_INVALID_VALUE,
                    message: "host scalar passed to a device-pointer-mode handle".to_string(),
                })
            }
            None => return invalid_handle(BlasHandle::KIND, handle.raw()),
        };
        if n == 0 {
            return Ok(());
        }
        let nbytes = n * std::mem::size_of::<f32>();
        state.check_device_range(x as usize, nbytes, "saxpy x")?;
        state.check_device_range(y as usize, nbytes, "saxpy y")?;

        // SAFETY: both ranges were just checked against live allocations and
        // the state lock keeps them alive for the duration of the loop.
        for i in 0..n {
            let xi = ptr::read_unaligned(x.add(i));
            let yi = ptr::read_unaligned(y.add(i));
            ptr::write_unaligned(y.add(i), alpha * xi + yi);
        }
        state.bump_pending(stream);
        Ok(())
    }

    fn create_rng(&self, device: usize) -> CudaResult<RngHandle> {
        self.check_device(device)?;
        let raw = self.next_raw();
        self.state.lock().rngs.insert(
            raw,
            SimRng {
                device,
                seed: 0,
                stream: None,
                generator: ChaCha8Rng::seed_from_u64(0),
            },
        );
        Ok(RngHandle::from_raw(raw))
    }

    fn rng_set_seed(&self, handle: RngHandle, seed: u64) -> CudaResult<()> {
        match self.state.lock().rngs.get_mut(&handle.raw()) {
            Some(rng) => {
                rng.seed = seed;
                rng.generator = ChaCha8Rng::seed_from_u64(seed);
                Ok(())
            }
            None => invalid_handle(RngHandle::KIND, handle.raw()),
        }
    }

    fn rng_set_stream(&self, handle: RngHandle, stream: Stream) -> CudaResult<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        match state.rngs.get_mut(&handle.raw()) {
            Some(rng) => {
                rng.stream = Some(stream.raw());
                Ok(())
            }
            None => invalid_handle(RngHandle::KIND, handle.raw()),
        }
    }

    fn destroy_rng(&self, handle: RngHandle) {
        if self.state.lock().rngs.remove(&handle.raw()).is_none() {
            warn!(handle = ?handle, "destroying unknown simulated RNG handle");
        }
    }

    unsafe fn generate_uniform(
        &self,
        handle: RngHandle,
        dst: *mut f32,
        n: usize,
    ) -> CudaResult<()> {
        let mut state = self.state.lock();
        if !state.rngs.contains_key(&handle.raw()) {
            return invalid_handle(RngHandle::KIND, handle.raw());
        }
        if n == 0 {
            return Ok(());
        }
        state.check_device_range(dst as usize, n * std::mem::size_of::<f32>(), "uniform dst")?;

        let Some(rng) = state.rngs.get_mut(&handle.raw()) else {
            return invalid_handle(RngHandle::KIND, handle.raw());
        };
        let stream = rng.stream;
        for i in 0..n {
            // (0, 1], matching the device library's uniform distribution.
            let value = 1.0 - rng.generator.gen::<f32>();
            // SAFETY: range checked above; the lock keeps the allocation alive.
            ptr::write_unaligned(dst.add(i), value);
        }
        state.bump_pending(stream);
        Ok(())
    }

    fn malloc(&self, device: usize, nbytes: usize) -> CudaResult<*mut u8> {
        self.check_device(device)?;
        if nbytes == 0 {
            return Ok(ptr::null_mut());
        }
        // Device allocation runs with the target device active; the caller's
        // active device is restored afterwards.
        let previous = self.current_device.swap(device, Ordering::AcqRel);
        let result = self.allocate_on(device, nbytes);
        self.current_device.store(previous, Ordering::Release);
        result
    }

    unsafe fn free(&self, ptr: *mut u8) -> CudaResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let allocation = state
            .device_memory
            .remove(&(ptr as usize))
            .ok_or(CudaError::UnknownPointer(ptr as usize))?;
        state.used_bytes[allocation.device] -= allocation.layout.size();
        alloc::dealloc(ptr, allocation.layout);
        Ok(())
    }

    fn malloc_host(&self, nbytes: usize) -> CudaResult<*mut u8> {
        if nbytes == 0 {
            return Ok(ptr::null_mut());
        }
        let layout = Layout::from_size_align(nbytes, SIM_ALIGNMENT).map_err(|e| CudaError::Api {
            call: "malloc_host",
            code: SIM_ERROR_INVALID_VALUE,
            message: e.to_string(),
        })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CudaError::Api {
                call: "malloc_host",
                code: SIM_ERROR_INVALID_VALUE,
                message: format!("host allocation of {} bytes failed", nbytes),
            });
        }
        self.state.lock().host_memory.insert(ptr as usize, layout);
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: *mut u8) -> CudaResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let layout = self
            .state
            .lock()
            .host_memory
            .remove(&(ptr as usize))
            .ok_or(CudaError::UnknownPointer(ptr as usize))?;
        alloc::dealloc(ptr, layout);
        Ok(())
    }

    unsafe fn memcpy_async(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        kind: MemcpyKind,
        stream: Stream,
    ) -> CudaResult<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        if nbytes == 0 {
            return Ok(());
        }
        let (src_addr, dst_addr) = (src as usize, dst as usize);
        match kind {
            MemcpyKind::HostToHost => {
                state.check_host_range(src_addr, nbytes, "source")?;
                state.check_host_range(dst_addr, nbytes, "destination")?;
            }
            MemcpyKind::HostToDevice => {
                state.check_host_range(src_addr, nbytes, "source")?;
                state.check_device_range(dst_addr, nbytes, "destination")?;
            }
            MemcpyKind::DeviceToHost => {
                state.check_device_range(src_addr, nbytes, "source")?;
                state.check_host_range(dst_addr, nbytes, "destination")?;
            }
            MemcpyKind::DeviceToDevice => {
                state.check_device_range(src_addr, nbytes, "source")?;
                state.check_device_range(dst_addr, nbytes, "destination")?;
            }
        }
        // SAFETY: device ranges are live allocations (checked under the lock);
        // host ranges are valid per the caller contract. `copy` tolerates overlap.
        ptr::copy(src, dst, nbytes);
        state.check_stream(stream)?.pending += 1;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (base, allocation) in std::mem::take(&mut state.device_memory) {
            // SAFETY: every entry was produced by alloc_zeroed with this layout.
            unsafe { alloc::dealloc(base as *mut u8, allocation.layout) };
        }
        for (base, layout) in std::mem::take(&mut state.host_memory) {
            // SAFETY: as above, for pinned host allocations.
            unsafe { alloc::dealloc(base as *mut u8, layout) };
        }
    }
}
