//! Core types shared by the opgraph execution layers.
//!
//! This crate carries the narrow interfaces the device layers consume:
//!
//! - [`DeviceOption`] / [`OperatorDef`]: where an operator runs and what it reads and writes
//! - [`HostTensor`]: typed, host-resident multi-dimensional buffer
//! - [`Workspace`] / [`Blob`]: named store of opaque typed containers
//! - [`Operator`] / [`HostOperator`]: the run capability every operator exposes
//! - [`config`]: layered runtime configuration
//!
//! Device-resident counterparts (execution contexts, device tensors, the host
//! fallback adapter) live in `opgraph-cuda`.

pub mod config;
pub mod device_option;
pub mod error;
pub mod logging;
pub mod operator;
pub mod ops;
pub mod tensor;
pub mod workspace;

pub use config::{
    BackendKind, DeviceConfig, LoggingConfig, MemoryConfig, RuntimeConfig, SyncFailurePolicy,
};
pub use device_option::{DeviceOption, DeviceType, OperatorDef};
pub use error::{CoreError, CoreResult};
pub use operator::{HostOperator, Operator, OperatorBase};
pub use tensor::{DataType, Element, HostTensor};
pub use workspace::{Blob, BlobRef, Workspace};
