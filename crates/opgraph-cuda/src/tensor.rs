//! Device-resident tensors and context-driven tensor copies.

use std::ptr;

use opgraph_core::tensor::numel_of;
use opgraph_core::{DataType, Element, HostTensor};
use tracing::warn;

use crate::context::CudaContext;
use crate::device::{Device, Host};
use crate::error::{CudaError, CudaResult};
use crate::{runtime, transfer};

/// Block of pool memory on one device, returned to the pool on drop.
#[derive(Debug)]
pub struct DeviceBuffer {
    ptr: *mut u8,
    nbytes: usize,
    device: usize,
}

// SAFETY: the buffer is plain device memory owned by this value; access goes
// through streams, never through host references.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    /// Allocate `nbytes` on the context's device.
    pub fn new(nbytes: usize, ctx: &CudaContext) -> CudaResult<Self> {
        let ptr = ctx.allocate(nbytes)?;
        Ok(Self {
            ptr,
            nbytes,
            device: ctx.device_id(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nbytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = runtime::memory_pool().release(self.ptr) {
            warn!(device = self.device, error = %e, "failed to release device buffer");
        }
    }
}

/// Typed multi-dimensional buffer in device memory.
///
/// A default-constructed tensor has no storage and no device; the first
/// copy into it allocates on the copying context's device.
#[derive(Debug)]
pub struct CudaTensor {
    dims: Vec<usize>,
    dtype: DataType,
    buffer: Option<DeviceBuffer>,
}

impl Default for CudaTensor {
    fn default() -> Self {
        Self {
            dims: vec![0],
            dtype: DataType::F32,
            buffer: None,
        }
    }
}

impl CudaTensor {
    /// Uninitialized tensor of the given shape on the context's device.
    pub fn new(dims: &[usize], dtype: DataType, ctx: &CudaContext) -> CudaResult<Self> {
        let mut tensor = Self::default();
        tensor.resize(dims, dtype, ctx)?;
        Ok(tensor)
    }

    /// Device copy of `host`, complete when this returns.
    ///
    /// # Errors
    ///
    /// Allocation or copy errors, or `CudaError::AsyncFault` if the device
    /// reports an error while the copy drains.
    pub fn from_host(host: &HostTensor, ctx: &CudaContext) -> CudaResult<Self> {
        let mut tensor = Self::default();
        // SAFETY: `host` is borrowed until the synchronize below.
        unsafe { tensor.copy_using(host, ctx)? };
        sync_or_fault(ctx)?;
        Ok(tensor)
    }

    /// Host copy of this tensor, complete when this returns.
    pub fn to_host(&self, ctx: &CudaContext) -> CudaResult<HostTensor> {
        let mut host = HostTensor::default();
        // SAFETY: `host` is local and read only after the synchronize below.
        unsafe { host.copy_using(self, ctx)? };
        sync_or_fault(ctx)?;
        Ok(host)
    }

    /// Host copy of this tensor without a caller-supplied context.
    ///
    /// The copy runs on the device that owns the storage, whatever device
    /// the calling code is working with.
    pub fn fetch(&self) -> CudaResult<HostTensor> {
        let mut host = HostTensor::new(&self.dims, self.dtype);
        // SAFETY: the buffer holds `nbytes` on its device and `host` was just
        // sized to match; the transfer completes before returning.
        unsafe {
            transfer::copy_device_to_host(self.nbytes(), self.as_ptr(), host.as_mut_ptr())?;
        }
        Ok(host)
    }

    /// Overwrite the contents with `host`, which must match in shape and type.
    ///
    /// Like [`CudaTensor::fetch`], runs on the device owning the storage.
    pub fn upload(&mut self, host: &HostTensor) -> CudaResult<()> {
        if host.dims() != self.dims() {
            return Err(CudaError::ShapeMismatch {
                expected: self.dims.clone(),
                actual: host.dims().to_vec(),
            });
        }
        if host.dtype() != self.dtype {
            return Err(CudaError::DTypeMismatch {
                expected: self.dtype,
                actual: host.dtype(),
            });
        }
        // SAFETY: sizes match; the transfer completes before returning.
        unsafe { transfer::copy_host_to_device(host.nbytes(), host.as_ptr(), self.as_mut_ptr()) }
    }

    /// Reshape to `dims`/`dtype`, reallocating on the context's device when
    /// the byte size or the device changes. Contents are unspecified after
    /// a reallocation.
    pub fn resize(&mut self, dims: &[usize], dtype: DataType, ctx: &CudaContext) -> CudaResult<()> {
        let nbytes = numel_of(dims) * dtype.item_size();
        let reusable = self
            .buffer
            .as_ref()
            .is_some_and(|b| b.len() == nbytes && b.device() == ctx.device_id());
        if !reusable {
            self.buffer = None;
            self.buffer = Some(DeviceBuffer::new(nbytes, ctx)?);
        }
        self.dims = dims.to_vec();
        self.dtype = dtype;
        Ok(())
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        numel_of(&self.dims)
    }

    pub fn nbytes(&self) -> usize {
        self.buffer.as_ref().map_or(0, DeviceBuffer::len)
    }

    /// Device holding the storage, if any has been allocated.
    pub fn device(&self) -> Option<usize> {
        self.buffer.as_ref().map(DeviceBuffer::device)
    }

    /// Device address of the elements (null when unallocated).
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ref().map_or(ptr::null(), DeviceBuffer::as_ptr)
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buffer
            .as_mut()
            .map_or(ptr::null_mut(), DeviceBuffer::as_mut_ptr)
    }

    /// Device address checked against `T`.
    pub fn data_ptr<T: Element>(&self) -> CudaResult<*const T> {
        self.check_dtype(T::DTYPE)?;
        Ok(self.as_ptr().cast())
    }

    pub fn data_mut_ptr<T: Element>(&mut self) -> CudaResult<*mut T> {
        self.check_dtype(T::DTYPE)?;
        Ok(self.as_mut_ptr().cast())
    }

    fn check_dtype(&self, expected: DataType) -> CudaResult<()> {
        if self.dtype != expected {
            return Err(CudaError::DTypeMismatch {
                expected,
                actual: self.dtype,
            });
        }
        Ok(())
    }
}

fn sync_or_fault(ctx: &CudaContext) -> CudaResult<()> {
    if ctx.synchronize() {
        Ok(())
    } else {
        Err(CudaError::AsyncFault {
            device: ctx.device_id(),
            message: "synchronization after tensor copy failed".to_string(),
        })
    }
}

/// "Copy from `Src`, using a given context."
///
/// The destination takes the source's shape and type. Device destinations
/// are (re)allocated on the context's device.
pub trait TensorCopy<Src: ?Sized> {
    /// # Safety
    ///
    /// Copies involving device memory are asynchronous: `self` and `src`
    /// must stay alive and unmodified until `ctx.synchronize()` returns.
    unsafe fn copy_using(&mut self, src: &Src, ctx: &CudaContext) -> CudaResult<()>;
}

impl TensorCopy<CudaTensor> for HostTensor {
    unsafe fn copy_using(&mut self, src: &CudaTensor, ctx: &CudaContext) -> CudaResult<()> {
        self.resize(src.dims(), src.dtype());
        ctx.copy::<Device, Host>(self.nbytes(), src.as_ptr(), self.as_mut_ptr())
    }
}

impl TensorCopy<HostTensor> for CudaTensor {
    unsafe fn copy_using(&mut self, src: &HostTensor, ctx: &CudaContext) -> CudaResult<()> {
        self.resize(src.dims(), src.dtype(), ctx)?;
        ctx.copy::<Host, Device>(src.nbytes(), src.as_ptr(), self.as_mut_ptr())
    }
}

impl TensorCopy<CudaTensor> for CudaTensor {
    unsafe fn copy_using(&mut self, src: &CudaTensor, ctx: &CudaContext) -> CudaResult<()> {
        self.resize(src.dims(), src.dtype(), ctx)?;
        ctx.copy::<Device, Device>(src.nbytes(), src.as_ptr(), self.as_mut_ptr())
    }
}

impl TensorCopy<HostTensor> for HostTensor {
    unsafe fn copy_using(&mut self, src: &HostTensor, _ctx: &CudaContext) -> CudaResult<()> {
        self.copy_from(src);
        Ok(())
    }
}
