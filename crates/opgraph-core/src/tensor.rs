//! Host-resident typed tensors.
//!
//! [`HostTensor`] stores its elements in 8-byte-aligned storage so that typed
//! views for every [`Element`] type are zero-copy casts of the same bytes.
//! Copy engines address the storage through [`HostTensor::as_ptr`] and
//! [`HostTensor::as_mut_ptr`].

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Element type tag carried by every tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    #[inline]
    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
        }
    }
}

/// Rust types that can be stored in a tensor.
pub trait Element: Pod + Default + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}
impl Element for f64 {
    const DTYPE: DataType = DataType::F64;
}
impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}
impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}
impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

/// Number of elements described by `dims` (1 for a scalar).
#[inline]
#[must_use]
pub fn numel_of(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Typed multi-dimensional buffer in host memory.
///
/// # Example
///
/// ```
/// use opgraph_core::HostTensor;
///
/// let t = HostTensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
/// assert_eq!(t.numel(), 4);
/// assert_eq!(t.nbytes(), 16);
/// assert_eq!(t.data::<f32>().unwrap()[3], 4.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dims: Vec<usize>,
    dtype: DataType,
    /// 8-byte words; only the first `nbytes` bytes are meaningful.
    storage: Vec<u64>,
    nbytes: usize,
}

impl Default for HostTensor {
    fn default() -> Self {
        Self {
            dims: vec![0],
            dtype: DataType::F32,
            storage: Vec::new(),
            nbytes: 0,
        }
    }
}

impl HostTensor {
    /// Zero-filled tensor of the given shape and type.
    pub fn new(dims: &[usize], dtype: DataType) -> Self {
        let nbytes = numel_of(dims) * dtype.item_size();
        Self {
            dims: dims.to_vec(),
            dtype,
            storage: vec![0u64; nbytes.div_ceil(8)],
            nbytes,
        }
    }

    pub fn zeros<T: Element>(dims: &[usize]) -> Self {
        Self::new(dims, T::DTYPE)
    }

    /// Tensor holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidSize` if `data.len()` does not match `dims`.
    pub fn from_slice<T: Element>(dims: &[usize], data: &[T]) -> CoreResult<Self> {
        let expected = numel_of(dims);
        if data.len() != expected {
            return Err(CoreError::InvalidSize {
                dims: dims.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        let mut tensor = Self::new(dims, T::DTYPE);
        tensor.data_mut::<T>()?.copy_from_slice(data);
        Ok(tensor)
    }

    /// One-dimensional tensor holding a copy of `data`.
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        let mut tensor = Self::new(&[data.len()], T::DTYPE);
        bytemuck::cast_slice_mut::<u8, T>(tensor.as_bytes_mut()).copy_from_slice(&data);
        tensor
    }

    /// Reshape to `dims`/`dtype`. Storage is reallocated (zeroed) only when the
    /// byte size changes; otherwise the existing bytes are kept.
    pub fn resize(&mut self, dims: &[usize], dtype: DataType) {
        let nbytes = numel_of(dims) * dtype.item_size();
        if nbytes != self.nbytes {
            self.storage = vec![0u64; nbytes.div_ceil(8)];
            self.nbytes = nbytes;
        }
        self.dims = dims.to_vec();
        self.dtype = dtype;
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[inline]
    pub fn numel(&self) -> usize {
        numel_of(&self.dims)
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.storage)[..self.nbytes]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.storage)[..nbytes]
    }

    /// Typed view of the elements.
    ///
    /// # Errors
    ///
    /// `CoreError::DTypeMismatch` if `T` is not the tensor's element type.
    pub fn data<T: Element>(&self) -> CoreResult<&[T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Mutable typed view of the elements.
    pub fn data_mut<T: Element>(&mut self) -> CoreResult<&mut [T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    pub fn to_vec<T: Element>(&self) -> CoreResult<Vec<T>> {
        Ok(self.data::<T>()?.to_vec())
    }

    /// Base address of the element bytes.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr().cast()
    }

    /// Mutable base address of the element bytes.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr().cast()
    }

    /// Host-to-host copy: take `src`'s shape, type and contents.
    pub fn copy_from(&mut self, src: &HostTensor) {
        self.resize(&src.dims, src.dtype);
        self.as_bytes_mut().copy_from_slice(src.as_bytes());
    }

    fn check_dtype(&self, expected: DataType) -> CoreResult<()> {
        if self.dtype != expected {
            return Err(CoreError::DTypeMismatch {
                expected,
                actual: self.dtype,
            });
        }
        Ok(())
    }
}
