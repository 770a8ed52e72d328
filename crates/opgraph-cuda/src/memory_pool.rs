//! Process-wide device memory pool.
//!
//! Every live block is recorded by base address, so the owning device of
//! any pointer into a block can be resolved and releasing a pointer the
//! pool never handed out is an error rather than undefined behavior.
//!
//! With caching enabled, block sizes are rounded up to
//! `MemoryConfig::block_rounding` and released blocks are kept per
//! `(device, size)` for reuse. An allocation that fails with
//! out-of-memory flushes the cache and is retried once.

use std::collections::{BTreeMap, HashMap};
use std::ptr;
use std::sync::Arc;

use opgraph_core::config::MAX_DEVICES;
use opgraph_core::MemoryConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::DeviceBackend;
use crate::error::{CudaError, CudaResult};

/// Per-device pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes held by callers (block sizes, after rounding).
    pub live_bytes: usize,
    pub live_blocks: usize,
    /// Bytes held in the cache for reuse.
    pub cached_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Allocations served, including cache hits.
    pub allocations: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    device: usize,
    size: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    live: BTreeMap<usize, Block>,
    cached: HashMap<(usize, usize), Vec<usize>>,
    stats: Vec<PoolStats>,
}

impl PoolState {
    fn stats_mut(&mut self, device: usize) -> &mut PoolStats {
        if self.stats.len() <= device {
            self.stats.resize(device + 1, PoolStats::default());
        }
        &mut self.stats[device]
    }
}

/// Device allocator shared by every context in the process.
#[derive(Debug)]
pub struct MemoryPool {
    backend: Arc<dyn DeviceBackend>,
    config: MemoryConfig,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: MemoryConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn block_size(&self, device: usize, nbytes: usize) -> CudaResult<usize> {
        if !self.config.caching {
            return Ok(nbytes);
        }
        let rounding = self.config.block_rounding.max(1);
        nbytes
            .checked_next_multiple_of(rounding)
            .ok_or(CudaError::OutOfMemory {
                device,
                requested: nbytes,
                available: 0,
            })
    }

    /// Allocate at least `nbytes` on `device`.
    ///
    /// A zero-byte request returns a null pointer that [`MemoryPool::release`]
    /// accepts.
    ///
    /// # Errors
    ///
    /// - `CudaError::InvalidDevice` if `device` is not visible
    /// - `CudaError::OutOfMemory` if the device is full even after flushing the cache
    pub fn allocate(&self, device: usize, nbytes: usize) -> CudaResult<*mut u8> {
        let count = self.backend.device_count().min(MAX_DEVICES);
        if device >= count {
            return Err(CudaError::InvalidDevice { device, count });
        }
        if nbytes == 0 {
            return Ok(ptr::null_mut());
        }

        let size = self.block_size(device, nbytes)?;
        let mut state = self.state.lock();

        let cached = state
            .cached
            .get_mut(&(device, size))
            .and_then(|blocks| blocks.pop());
        let (ptr, hit) = match cached {
            Some(addr) => (addr as *mut u8, true),
            None => (self.malloc_with_retry(&mut state, device, size)?, false),
        };

        state.live.insert(ptr as usize, Block { device, size });
        let stats = state.stats_mut(device);
        if hit {
            stats.cached_bytes -= size;
            stats.cache_hits += 1;
        }
        stats.allocations += 1;
        stats.live_bytes += size;
        stats.live_blocks += 1;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);

        debug!(device, requested = nbytes, size, cache_hit = hit, ptr = ?ptr, "device allocation");
        Ok(ptr)
    }

    fn malloc_with_retry(
        &self,
        state: &mut PoolState,
        device: usize,
        size: usize,
    ) -> CudaResult<*mut u8> {
        match self.backend.malloc(device, size) {
            Err(CudaError::OutOfMemory { .. }) if !state.cached.is_empty() => {
                let freed = self.flush_cache(state);
                warn!(device, size, freed, "out of device memory, flushed cache and retrying");
                self.backend.malloc(device, size)
            }
            result => result,
        }
    }

    /// Return a block to the pool.
    ///
    /// # Errors
    ///
    /// `CudaError::UnknownPointer` if `ptr` is not the base of a live block.
    pub fn release(&self, ptr: *mut u8) -> CudaResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let block = state
            .live
            .remove(&(ptr as usize))
            .ok_or(CudaError::UnknownPointer(ptr as usize))?;

        let caching = self.config.caching;
        let stats = state.stats_mut(block.device);
        stats.live_bytes -= block.size;
        stats.live_blocks -= 1;
        debug!(device = block.device, size = block.size, ptr = ?ptr, "device release");

        if caching {
            stats.cached_bytes += block.size;
            state
                .cached
                .entry((block.device, block.size))
                .or_default()
                .push(ptr as usize);
            return Ok(());
        }
        // SAFETY: ptr was returned by backend.malloc and was live until now.
        unsafe { self.backend.free(ptr) }
    }

    /// Device owning the live block that contains `ptr`.
    pub fn device_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let state = self.state.lock();
        let (base, block) = state.live.range(..=addr).next_back()?;
        (addr < base + block.size).then_some(block.device)
    }

    /// Free every cached block. Returns the number of bytes returned to the devices.
    pub fn empty_cache(&self) -> usize {
        let mut state = self.state.lock();
        let freed = self.flush_cache(&mut state);
        if freed > 0 {
            info!(freed, "device memory cache emptied");
        }
        freed
    }

    fn flush_cache(&self, state: &mut PoolState) -> usize {
        let mut freed = 0;
        for ((device, size), blocks) in std::mem::take(&mut state.cached) {
            for addr in blocks {
                // SAFETY: cached blocks came from backend.malloc and are not
                // referenced by any caller.
                match unsafe { self.backend.free(addr as *mut u8) } {
                    Ok(()) => freed += size,
                    Err(e) => warn!(device, addr, error = %e, "failed to free cached block"),
                }
                let stats = state.stats_mut(device);
                stats.cached_bytes -= size;
            }
        }
        freed
    }

    /// Counters for `device`.
    pub fn stats(&self, device: usize) -> PoolStats {
        self.state
            .lock()
            .stats
            .get(device)
            .copied()
            .unwrap_or_default()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut());
        let freed = self.flush_cache(&mut state);
        if freed > 0 {
            debug!(freed, "memory pool dropped, cache released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;

    fn pool(caching: bool, capacity: usize) -> (Arc<SimulatedBackend>, MemoryPool) {
        let backend = Arc::new(SimulatedBackend::new(2, capacity));
        let pool = MemoryPool::new(
            backend.clone(),
            MemoryConfig {
                caching,
                block_rounding: 512,
            },
        );
        (backend, pool)
    }

    #[test]
    fn test_allocate_release_stats() {
        let (backend, pool) = pool(false, 1 << 20);
        let p = pool.allocate(1, 100).unwrap();
        let stats = pool.stats(1);
        assert_eq!(stats.live_bytes, 100);
        assert_eq!(stats.live_blocks, 1);
        assert_eq!(backend.bytes_in_use(1), 100);

        pool.release(p).unwrap();
        let stats = pool.stats(1);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 100);
        assert_eq!(backend.bytes_in_use(1), 0);
    }

    #[test]
    fn test_release_unknown_pointer_is_error() {
        let (_backend, pool) = pool(true, 1 << 20);
        let mut local = 0u8;
        let err = pool.release(&mut local as *mut u8).unwrap_err();
        assert!(matches!(err, CudaError::UnknownPointer(_)));

        let p = pool.allocate(0, 16).unwrap();
        pool.release(p).unwrap();
        assert!(
            matches!(pool.release(p), Err(CudaError::UnknownPointer(_))),
            "double release must be rejected"
        );
    }

    #[test]
    fn test_device_of_interior_pointer() {
        let (_backend, pool) = pool(false, 1 << 20);
        let a = pool.allocate(0, 64).unwrap();
        let b = pool.allocate(1, 64).unwrap();
        assert_eq!(pool.device_of(a), Some(0));
        assert_eq!(pool.device_of(unsafe { b.add(63) }), Some(1));
        assert_eq!(pool.device_of(ptr::null()), None);
        pool.release(b).unwrap();
        assert_eq!(pool.device_of(b), None);
        pool.release(a).unwrap();
    }

    #[test]
    fn test_caching_reuses_rounded_blocks() {
        let (backend, pool) = pool(true, 1 << 20);
        let p = pool.allocate(0, 100).unwrap();
        assert_eq!(pool.stats(0).live_bytes, 512);
        pool.release(p).unwrap();
        assert_eq!(pool.stats(0).cached_bytes, 512);
        assert_eq!(backend.bytes_in_use(0), 512, "cached block stays allocated");

        let q = pool.allocate(0, 300).unwrap();
        assert_eq!(q, p, "same rounded size reuses the cached block");
        assert_eq!(pool.stats(0).cache_hits, 1);
        pool.release(q).unwrap();

        assert_eq!(pool.empty_cache(), 512);
        assert_eq!(pool.stats(0).cached_bytes, 0);
        assert_eq!(backend.bytes_in_use(0), 0);
    }

    #[test]
    fn test_out_of_memory_flushes_cache_and_retries() {
        let (_backend, pool) = pool(true, 1024);
        let p = pool.allocate(0, 1024).unwrap();
        pool.release(p).unwrap();
        // The cached 1024-byte block fills the device; a 512-byte request
        // only fits after the cache is flushed.
        let q = pool.allocate(0, 512).unwrap();
        assert_eq!(pool.stats(0).cached_bytes, 0);
        pool.release(q).unwrap();
    }

    #[test]
    fn test_out_of_memory_without_cache() {
        let (_backend, pool) = pool(false, 1024);
        let err = pool.allocate(0, 2048).unwrap_err();
        assert!(matches!(err, CudaError::OutOfMemory { device: 0, .. }));
    }

    #[test]
    fn test_rounding_overflow_is_out_of_memory() {
        let (backend, pool) = pool(true, 1024);
        let err = pool.allocate(0, usize::MAX - 10).unwrap_err();
        assert!(matches!(
            err,
            CudaError::OutOfMemory { device: 0, requested, .. } if requested == usize::MAX - 10
        ));
        assert_eq!(pool.stats(0), PoolStats::default());
        assert_eq!(backend.bytes_in_use(0), 0);
    }

    #[test]
    fn test_invalid_device_and_zero_size() {
        let (_backend, pool) = pool(true, 1024);
        assert!(matches!(
            pool.allocate(2, 8),
            Err(CudaError::InvalidDevice { device: 2, count: 2 })
        ));
        let p = pool.allocate(0, 0).unwrap();
        assert!(p.is_null());
        pool.release(p).unwrap();
    }
}
