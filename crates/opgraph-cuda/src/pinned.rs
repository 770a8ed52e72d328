//! Page-locked host buffers.

use std::slice;

use tracing::warn;

use crate::error::CudaResult;
use crate::runtime;

/// Page-locked host allocation, freed on drop.
#[derive(Debug)]
pub struct PinnedBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Allocate `len` bytes of pinned memory. Contents are unspecified.
    pub fn new(len: usize) -> CudaResult<Self> {
        let ptr = runtime::backend().malloc_host(len)?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr addresses `len` bytes owned by self.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.ptr.is_null() {
            return &mut [];
        }
        // SAFETY: ptr addresses `len` bytes exclusively owned by self.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr came from malloc_host and is freed exactly once.
        if let Err(e) = unsafe { runtime::backend().free_host(self.ptr) } {
            warn!(len = self.len, error = %e, "failed to free pinned host buffer");
        }
    }
}
