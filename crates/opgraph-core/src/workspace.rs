//! Named store of opaque typed containers.
//!
//! A [`Workspace`] maps names to shared [`Blob`] slots. Operators resolve
//! their inputs and outputs once at construction and keep the [`BlobRef`]
//! handles, so later writes through the workspace are visible to them.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};

/// Opaque typed container.
///
/// Holds at most one value of any `Send + Sync` type. Typed accessors
/// return `None` when the blob is empty or holds a different type.
#[derive(Default)]
pub struct Blob {
    value: Option<Box<dyn Any + Send + Sync>>,
    type_name: Option<&'static str>,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("type", &self.type_name.unwrap_or("<empty>"))
            .finish()
    }
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the blob currently holds a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.as_ref().is_some_and(|v| v.is::<T>())
    }

    /// Type name of the held value, if any.
    pub fn type_name(&self) -> Option<&'static str> {
        self.type_name
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut().and_then(|v| v.downcast_mut::<T>())
    }

    /// Mutable access to a `T`, replacing any differently typed (or absent)
    /// value with `T::default()` first.
    pub fn get_mut_or_default<T: Any + Send + Sync + Default>(&mut self) -> &mut T {
        if !self.is::<T>() {
            self.set(T::default());
        }
        match self.value.as_mut().and_then(|v| v.downcast_mut::<T>()) {
            Some(value) => value,
            None => unreachable!("blob was just set to {}", type_name::<T>()),
        }
    }

    /// Store `value`, dropping whatever was held before.
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.value = Some(Box::new(value));
        self.type_name = Some(type_name::<T>());
    }

    /// Drop the held value.
    pub fn reset(&mut self) {
        self.value = None;
        self.type_name = None;
    }
}

/// Shared handle to a workspace slot.
pub type BlobRef = Arc<RwLock<Blob>>;

/// Name → blob store.
///
/// # Example
///
/// ```
/// use opgraph_core::{HostTensor, Workspace};
///
/// let mut ws = Workspace::new();
/// let blob = ws.create_blob("X");
/// blob.write().set(HostTensor::from_vec(vec![1.0f32, 2.0]));
///
/// let again = ws.get_blob("X").unwrap();
/// assert!(again.read().is::<HostTensor>());
/// ```
#[derive(Debug, Default)]
pub struct Workspace {
    blobs: HashMap<String, BlobRef>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if absent and return its slot. Existing blobs are
    /// returned unchanged.
    pub fn create_blob(&mut self, name: &str) -> BlobRef {
        if let Some(existing) = self.blobs.get(name) {
            return Arc::clone(existing);
        }
        tracing::trace!(blob = name, "creating blob");
        let blob: BlobRef = Arc::new(RwLock::new(Blob::new()));
        self.blobs.insert(name.to_string(), Arc::clone(&blob));
        blob
    }

    pub fn get_blob(&self, name: &str) -> Option<BlobRef> {
        self.blobs.get(name).map(Arc::clone)
    }

    /// Like [`Workspace::get_blob`] but failing with `CoreError::MissingBlob`.
    pub fn require_blob(&self, name: &str) -> CoreResult<BlobRef> {
        self.get_blob(name).ok_or_else(|| CoreError::MissingBlob {
            name: name.to_string(),
        })
    }

    #[inline]
    pub fn has_blob(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    /// Remove a blob. Handles already held elsewhere stay valid.
    pub fn remove_blob(&mut self, name: &str) -> Option<BlobRef> {
        self.blobs.remove(name)
    }

    /// Blob names in sorted order.
    pub fn blob_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.keys().cloned().collect();
        names.sort();
        names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
