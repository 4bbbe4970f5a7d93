//! Per-kind inode capabilities.
//!
//! Data IO is dispatched through four small traits. Each inode kind is a
//! variant of [`InodeOps`] and implements the capabilities it supports;
//! the rest reject the call with an error instead of reaching the engine.

use crate::inode::Inode;
use crate::ordered::OrderedExtent;
use cfs_btree::items::mode;
use cfs_error::{CfsError, Result};
use cfs_extent::ExtentBits;
use std::sync::Arc;
use tracing::warn;

pub trait ReadPage {
    fn read_pages(&self, inode: &Arc<Inode>, offset: u64, len: u64) -> Result<Vec<u8>>;
}

pub trait WritePage {
    fn write_pages(&self, inode: &Arc<Inode>, offset: u64, data: &[u8]) -> Result<usize>;
}

pub trait SubmitIo {
    /// Submit the bytes of an ordered extent to the IO engine.
    fn submit(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>, data: Vec<u8>);
}

pub trait EndIoHook {
    /// Runs on the endio pool once every byte of `oe` was reported.
    fn end_io(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegularOps;

impl ReadPage for RegularOps {
    fn read_pages(&self, inode: &Arc<Inode>, offset: u64, len: u64) -> Result<Vec<u8>> {
        inode.read_data(offset, len)
    }
}

impl WritePage for RegularOps {
    fn write_pages(&self, inode: &Arc<Inode>, offset: u64, data: &[u8]) -> Result<usize> {
        inode.buffered_write(offset, data, ExtentBits::empty())
    }
}

impl SubmitIo for RegularOps {
    fn submit(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>, data: Vec<u8>) {
        inode.submit_ordered(oe, data);
    }
}

impl EndIoHook for RegularOps {
    fn end_io(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>) {
        inode.finish_ordered_io(oe);
    }
}

/// Symlinks: the target is written once at creation and stored inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymlinkOps;

impl ReadPage for SymlinkOps {
    fn read_pages(&self, inode: &Arc<Inode>, offset: u64, len: u64) -> Result<Vec<u8>> {
        inode.read_data(offset, len)
    }
}

impl WritePage for SymlinkOps {
    fn write_pages(&self, inode: &Arc<Inode>, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(CfsError::InvalidArgument(format!(
            "symlink {} is immutable",
            inode.ino().0
        )))
    }
}

impl SubmitIo for SymlinkOps {
    fn submit(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>, data: Vec<u8>) {
        inode.submit_ordered(oe, data);
    }
}

impl EndIoHook for SymlinkOps {
    fn end_io(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>) {
        inode.finish_ordered_io(oe);
    }
}

/// Directories and device nodes carry no file data.
#[derive(Debug, Clone, Copy)]
pub struct SpecialOps {
    is_dir: bool,
}

impl SpecialOps {
    fn reject(self, inode: &Inode) -> CfsError {
        if self.is_dir {
            CfsError::IsDirectory
        } else {
            CfsError::InvalidArgument(format!("inode {} has no data", inode.ino().0))
        }
    }
}

impl ReadPage for SpecialOps {
    fn read_pages(&self, inode: &Arc<Inode>, _offset: u64, _len: u64) -> Result<Vec<u8>> {
        Err(self.reject(inode))
    }
}

impl WritePage for SpecialOps {
    fn write_pages(&self, inode: &Arc<Inode>, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(self.reject(inode))
    }
}

impl SubmitIo for SpecialOps {
    fn submit(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>, _data: Vec<u8>) {
        warn!(
            target: "cfs::inode",
            ino = inode.ino().0,
            file_offset = oe.file_offset,
            "data submission on an inode without data"
        );
        inode.report_io(oe, oe.file_offset, oe.num_bytes, false);
    }
}

impl EndIoHook for SpecialOps {
    fn end_io(&self, inode: &Arc<Inode>, oe: &Arc<OrderedExtent>) {
        inode.finish_ordered_io(oe);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InodeOps {
    Regular(RegularOps),
    Symlink(SymlinkOps),
    Special(SpecialOps),
}

impl InodeOps {
    #[must_use]
    pub fn for_mode(mode_bits: u32) -> Self {
        match mode_bits & mode::S_IFMT {
            mode::S_IFREG => Self::Regular(RegularOps),
            mode::S_IFLNK => Self::Symlink(SymlinkOps),
            kind => Self::Special(SpecialOps {
                is_dir: kind == mode::S_IFDIR,
            }),
        }
    }

    #[must_use]
    pub fn reader(&self) -> &dyn ReadPage {
        match self {
            Self::Regular(ops) => ops,
            Self::Symlink(ops) => ops,
            Self::Special(ops) => ops,
        }
    }

    #[must_use]
    pub fn writer(&self) -> &dyn WritePage {
        match self {
            Self::Regular(ops) => ops,
            Self::Symlink(ops) => ops,
            Self::Special(ops) => ops,
        }
    }

    #[must_use]
    pub fn submitter(&self) -> &dyn SubmitIo {
        match self {
            Self::Regular(ops) => ops,
            Self::Symlink(ops) => ops,
            Self::Special(ops) => ops,
        }
    }

    #[must_use]
    pub fn end_io_hook(&self) -> &dyn EndIoHook {
        match self {
            Self::Regular(ops) => ops,
            Self::Symlink(ops) => ops,
            Self::Special(ops) => ops,
        }
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        !matches!(self, Self::Special(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selects_kind() {
        assert!(matches!(
            InodeOps::for_mode(mode::S_IFREG | 0o644),
            InodeOps::Regular(_)
        ));
        assert!(matches!(
            InodeOps::for_mode(mode::S_IFLNK | 0o777),
            InodeOps::Symlink(_)
        ));
        let dir = InodeOps::for_mode(mode::S_IFDIR | 0o755);
        assert!(!dir.has_data());
        assert!(matches!(dir, InodeOps::Special(SpecialOps { is_dir: true })));
        assert!(matches!(
            InodeOps::for_mode(mode::S_IFIFO),
            InodeOps::Special(SpecialOps { is_dir: false })
        ));
    }
}
