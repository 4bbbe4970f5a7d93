#![forbid(unsafe_code)]
//! CowFS public API facade.
//!
//! Re-exports the mount layer from `cfs-core` through a stable external
//! interface. This is the crate the harness and other downstream
//! consumers depend on.

pub use cfs_core::*;
