//! Host operator implementations.

mod elementwise;

pub use elementwise::AddOp;
