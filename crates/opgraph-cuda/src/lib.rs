#![deny(deprecated)]

//! CUDA execution layer for opgraph.
//!
//! This crate provides:
//! - [`CudaContext`]: per-operation device context (stream, BLAS and RNG
//!   handles, allocation, copies, synchronization)
//! - a per-thread registry of streams and library handles, created lazily
//!   and torn down when the thread exits
//! - [`MemoryPool`]: the process-wide device allocator
//! - [`CudaTensor`] and [`TensorCopy`]: device tensors and context-driven copies
//! - [`CudaFallbackOp`]: runs a host-only operator inside a device pipeline
//!
//! # Backends
//!
//! With the `cuda` feature, devices are real GPUs driven through cudart,
//! cuBLAS and cuRAND. Without it (and on machines with no visible GPU) an
//! in-process [`SimulatedBackend`] stands in, with the same contracts.
//!
//! # Example
//!
//! ```
//! use opgraph_core::HostTensor;
//! use opgraph_cuda::{CudaContext, CudaTensor};
//!
//! let ctx = CudaContext::new(0).unwrap();
//! let host = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0]);
//! let device = CudaTensor::from_host(&host, &ctx).unwrap();
//! assert_eq!(device.to_host(&ctx).unwrap(), host);
//! ```

pub mod backend;
pub mod context;
pub mod device;
pub mod error;
pub mod fallback;
pub mod ffi;
pub mod math;
pub mod memory_pool;
pub mod pinned;
mod resources;
pub mod runtime;
pub mod tensor;
pub mod transfer;

pub use backend::{BlasHandle, DeviceBackend, RngHandle, SimulatedBackend, Stream};
#[cfg(feature = "cuda")]
pub use backend::CudaBackend;
pub use context::{CudaContext, DEFAULT_RANDOM_SEED};
pub use device::{Device, DeviceGuard, Host, Location, MemorySpace};
pub use error::{CudaError, CudaResult};
pub use fallback::CudaFallbackOp;
pub use memory_pool::{MemoryPool, PoolStats};
pub use pinned::PinnedBuffer;
pub use tensor::{CudaTensor, DeviceBuffer, TensorCopy};
