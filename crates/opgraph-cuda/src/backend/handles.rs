//! Opaque device library handles.
//!
//! Handles are plain copyable identifiers, but none of them is `Send`: a
//! stream, BLAS handle or RNG handle belongs to the thread that created it
//! and must not leave that thread.

use std::fmt;
use std::marker::PhantomData;

/// Marker making a type `!Send + !Sync`.
type ThreadBound = PhantomData<*const ()>;

macro_rules! device_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            raw: usize,
            _thread: ThreadBound,
        }

        impl $name {
            /// Wrap a backend-issued raw handle.
            #[inline]
            pub(crate) fn from_raw(raw: usize) -> Self {
                Self {
                    raw,
                    _thread: PhantomData,
                }
            }

            /// Backend-specific raw value (an address for CUDA, an id for
            /// the simulated backend).
            #[inline]
            #[must_use]
            pub fn raw(self) -> usize {
                self.raw
            }

            pub(crate) const KIND: &'static str = $kind;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.raw)
            }
        }
    };
}

device_handle!(
    /// Ordered queue of asynchronous device work.
    Stream,
    "stream"
);

device_handle!(
    /// Linear-algebra library instance bound to one device and stream.
    BlasHandle,
    "blas"
);

device_handle!(
    /// Pseudo-random generator bound to one device and stream.
    RngHandle,
    "rng"
);
