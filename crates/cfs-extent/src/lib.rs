#![forbid(unsafe_code)]
//! Per-inode in-memory extent state.
//!
//! - [`extent_map`]: which physical bytes (or hole, inline payload, pending
//!   delalloc) back each file range.
//! - [`extent_io_tree`]: range-tagged bits (`DELALLOC`, `LOCKED`, ...) with
//!   transition hooks that drive reservation accounting.

pub mod extent_io_tree;
pub mod extent_map;

pub use extent_io_tree::{ExtentBits, ExtentIoHooks, ExtentIoTree, NoHooks, StateRange};
pub use extent_map::{BlockStart, ExtentMap, ExtentMapError, ExtentMapFlags, ExtentMapTree};
