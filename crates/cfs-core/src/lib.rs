#![forbid(unsafe_code)]
//! CowFS mount layer.
//!
//! Parses and validates [`MountOptions`], mounts a [`Filesystem`] over one
//! or more mirrored devices and exposes the file, snapshot and writeback
//! operations of the data engine. [`check_metadata`] cross-checks a
//! committed image offline.

pub mod check;
pub mod filesystem;
pub mod options;

pub use check::{ConsistencyReport, Inconsistency, check_metadata};
pub use filesystem::{DATA_START, Filesystem, UsageReport};
pub use options::{CompressionOptions, EngineKind, MountOptions, parse_size};

pub use cfs_btree::MetadataImage;
pub use cfs_error::{CfsError, Result};
pub use cfs_inode::{CorruptionRecord, FileHandle, Inode};
pub use cfs_types::{CompressionType, Generation, InodeNumber, RootId};
