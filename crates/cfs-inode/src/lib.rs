#![forbid(unsafe_code)]
//! Data engine: delalloc, ordered extents, COW and No-COW writeback.
//!
//! Buffered writes land in the page cache as delalloc ranges. Flushing
//! turns each range into an ordered extent backed by a new extent (COW,
//! optionally compressed), an existing one (No-COW, preallocated) or an
//! inline item. Completion commits the file extent item, its backref and
//! its checksums, then retires the ordered extent.
//!
//! Lock order: IO tree range lock, then accounting, then the root's
//! delalloc list, then the registry. Hooks run under the IO tree lock.

pub mod accounting;
pub mod compress_async;
mod completion;
mod cow;
pub mod diagnostics;
pub mod file_extents;
pub mod file_ops;
pub mod fs_info;
pub mod inode;
pub mod nocow;
pub mod ops;
pub mod ordered;
pub mod page_cache;
pub mod read;
pub mod root;
pub mod workers;
mod write;

pub use accounting::{AcctState, InodeAccounting};
pub use compress_async::{Piece, PieceOutcome, decide_piece};
pub use diagnostics::{CorruptionRecord, DiagnosticsLog};
pub use file_extents::DroppedExtents;
pub use file_ops::{DEFAULT_DEFRAG_THRESH, FileHandle};
pub use fs_info::{FsConfig, FsInfo};
pub use inode::{ErrSeq, Inode, InodeFlags, InodeState};
pub use nocow::{NocowCheck, NocowCtx, NocowExtent, NocowVerdict, check_nocow};
pub use ops::{EndIoHook, InodeOps, ReadPage, SubmitIo, WritePage};
pub use ordered::{
    NewOrdered, OrderedExtent, OrderedFlags, OrderedKind, OrderedState, OrderedSums, OrderedTree,
};
pub use page_cache::{PageCache, PageFlags};
pub use read::em_from_item;
pub use root::{DelallocRegistry, PendingSnapshot, Root, RootDelalloc};
pub use workers::{TaskHandle, WorkerPool};
