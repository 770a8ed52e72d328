//! Error types for opgraph-cuda.

use opgraph_core::{CoreError, DataType};
use thiserror::Error;

/// Errors raised by device backends, contexts, the memory pool and the
/// host-fallback adapter.
#[derive(Debug, Error)]
pub enum CudaError {
    /// No device is visible to the backend.
    #[error("No CUDA device available")]
    NoDevice,

    /// Device index outside the visible range.
    #[error("Invalid device {device}: {count} device(s) available")]
    InvalidDevice { device: usize, count: usize },

    /// A device API call returned a non-success status.
    #[error("{call} failed with code {code}: {message}")]
    Api {
        call: &'static str,
        code: i32,
        message: String,
    },

    /// An asynchronous device error observed at a synchronization point.
    #[error("Asynchronous device error on device {device}: {message}")]
    AsyncFault { device: usize, message: String },

    /// Device allocation exceeded capacity.
    #[error("Out of device memory on device {device}: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        device: usize,
        requested: usize,
        available: usize,
    },

    /// Pointer was not handed out by the device memory pool.
    #[error("Pointer {0:#x} was not allocated by the device memory pool")]
    UnknownPointer(usize),

    /// A copy touched memory outside any live allocation.
    #[error("Invalid memory access: {0}")]
    InvalidAccess(String),

    /// Handle does not belong to the backend (destroyed, or foreign).
    #[error("Invalid {kind} handle {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: usize },

    /// Descriptor placement is not usable by a device context.
    #[error("Invalid device option: {0}")]
    InvalidDeviceOption(String),

    /// A blob the adapter depends on is missing.
    #[error("Blob '{name}' not found ({context})")]
    MissingBlob { name: String, context: &'static str },

    /// A blob holds something other than the expected tensor type.
    #[error("Blob '{name}' does not hold a {expected}")]
    BlobTypeMismatch { name: String, expected: &'static str },

    /// Tensor element types disagree.
    #[error("Data type mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DataType, actual: DataType },

    /// Tensor shapes disagree.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Operands live on different devices.
    #[error("Device mismatch: expected device {expected}, got device {actual}")]
    DeviceMismatch { expected: usize, actual: usize },

    /// The requested backend is not compiled in.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Process-wide runtime state was already installed.
    #[error("Runtime already initialized; init() must run before any device use")]
    AlreadyInitialized,

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type alias for device operations.
pub type CudaResult<T> = std::result::Result<T, CudaError>;
