//! Error types for opgraph-core.

use thiserror::Error;

use crate::tensor::DataType;

/// Errors raised by descriptors, tensors, workspaces and configuration.
///
/// # Examples
///
/// ```rust
/// use opgraph_core::{CoreError, Workspace};
///
/// let ws = Workspace::new();
/// let err = ws.require_blob("missing").unwrap_err();
/// assert!(matches!(err, CoreError::MissingBlob { .. }));
/// ```
#[derive(Debug, Error)]
pub enum CoreError {
    /// A named blob does not exist in the workspace.
    #[error("Blob '{name}' not found in workspace")]
    MissingBlob { name: String },

    /// A blob exists but holds a different type than requested.
    #[error("Blob '{name}' does not hold a {expected}")]
    BlobTypeMismatch { name: String, expected: &'static str },

    /// Tensor shapes disagree.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensor element types disagree.
    #[error("Data type mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DataType, actual: DataType },

    /// Element count does not fit the requested dimensions.
    #[error("Invalid tensor size: dims {dims:?} need {expected} elements, got {actual}")]
    InvalidSize {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// The operator descriptor is malformed for the requested use.
    #[error("Invalid operator definition: {0}")]
    InvalidOperatorDef(String),

    /// Configuration is invalid or could not be loaded.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::ConfigError(err.to_string())
    }
}

/// Result type alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
