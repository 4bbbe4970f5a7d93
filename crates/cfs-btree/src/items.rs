//! Item payload codecs.
//!
//! Every payload is little-endian. File extent items use the classic
//! layout: a 21-byte header, then either inline data or four `u64` disk
//! fields.
//!
//! ```text
//! off  size  field
//!   0     8  generation
//!   8     8  ram_bytes
//!  16     1  compression
//!  17     1  encryption
//!  18     2  other_encoding
//!  20     1  type (0 inline, 1 regular, 2 prealloc)
//!  21     8  disk_bytenr        (regular/prealloc only)
//!  29     8  disk_num_bytes
//!  37     8  offset
//!  45     8  num_bytes
//! ```

use cfs_types::{
    CompressionType, FILE_EXTENT_INLINE_DATA_START, FILE_EXTENT_ITEM_SIZE, ParseError,
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

// ── Inode item ──────────────────────────────────────────────────────────────

pub const INODE_ITEM_SIZE: usize = 44;

/// Per-inode flag bits persisted in the inode item.
pub mod inode_flags {
    pub const NODATASUM: u64 = 1 << 0;
    pub const NODATACOW: u64 = 1 << 1;
    pub const COMPRESS: u64 = 1 << 2;
    pub const NOCOMPRESS: u64 = 1 << 3;
    pub const PREALLOC: u64 = 1 << 4;
}

/// File type bits of `InodeItem::mode`.
pub mod mode {
    pub const S_IFMT: u32 = 0o170_000;
    pub const S_IFREG: u32 = 0o100_000;
    pub const S_IFDIR: u32 = 0o040_000;
    pub const S_IFLNK: u32 = 0o120_000;
    pub const S_IFCHR: u32 = 0o020_000;
    pub const S_IFBLK: u32 = 0o060_000;
    pub const S_IFIFO: u32 = 0o010_000;
    pub const S_IFSOCK: u32 = 0o140_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub flags: u64,
    pub mode: u32,
}

impl InodeItem {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INODE_ITEM_SIZE);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.transid.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.nbytes.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, INODE_ITEM_SIZE)?;
        Ok(Self {
            generation: read_le_u64(data, 0)?,
            transid: read_le_u64(data, 8)?,
            size: read_le_u64(data, 16)?,
            nbytes: read_le_u64(data, 24)?,
            flags: read_le_u64(data, 32)?,
            mode: read_le_u32(data, 40)?,
        })
    }
}

// ── File extent item ────────────────────────────────────────────────────────

/// Location of a regular or preallocated extent's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRef {
    /// Physical start; 0 means hole.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Offset into the uncompressed extent where this file range begins.
    pub offset: u64,
    /// File bytes covered by this item.
    pub num_bytes: u64,
}

impl DiskRef {
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.disk_bytenr == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtentKind {
    Inline(Vec<u8>),
    Regular(DiskRef),
    Prealloc(DiskRef),
}

impl FileExtentKind {
    #[must_use]
    pub fn raw_type(&self) -> u8 {
        match self {
            Self::Inline(_) => 0,
            Self::Regular(_) => 1,
            Self::Prealloc(_) => 2,
        }
    }

    #[must_use]
    pub fn disk(&self) -> Option<&DiskRef> {
        match self {
            Self::Inline(_) => None,
            Self::Regular(d) | Self::Prealloc(d) => Some(d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentItem {
    pub generation: u64,
    /// Uncompressed size of the whole extent (inline: decompressed payload).
    pub ram_bytes: u64,
    pub compression: CompressionType,
    pub encryption: u8,
    pub other_encoding: u16,
    pub kind: FileExtentKind,
}

impl FileExtentItem {
    /// File bytes covered by the item.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        match &self.kind {
            FileExtentKind::Inline(_) => self.ram_bytes,
            FileExtentKind::Regular(d) | FileExtentKind::Prealloc(d) => d.num_bytes,
        }
    }

    /// Whether the item stores anything beyond the raw data layout.
    #[must_use]
    pub fn is_encoded(&self) -> bool {
        self.compression.is_compressed() || self.encryption != 0 || self.other_encoding != 0
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_EXTENT_ITEM_SIZE);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.ram_bytes.to_le_bytes());
        out.push(self.compression.to_raw());
        out.push(self.encryption);
        out.extend_from_slice(&self.other_encoding.to_le_bytes());
        out.push(self.kind.raw_type());
        match &self.kind {
            FileExtentKind::Inline(data) => out.extend_from_slice(data),
            FileExtentKind::Regular(d) | FileExtentKind::Prealloc(d) => {
                out.extend_from_slice(&d.disk_bytenr.to_le_bytes());
                out.extend_from_slice(&d.disk_num_bytes.to_le_bytes());
                out.extend_from_slice(&d.offset.to_le_bytes());
                out.extend_from_slice(&d.num_bytes.to_le_bytes());
            }
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, FILE_EXTENT_INLINE_DATA_START)?;
        let generation = read_le_u64(data, 0)?;
        let ram_bytes = read_le_u64(data, 8)?;
        let compression = CompressionType::from_raw(read_u8(data, 16)?)?;
        let encryption = read_u8(data, 17)?;
        let other_encoding = read_le_u16(data, 18)?;
        let kind = match read_u8(data, 20)? {
            0 => FileExtentKind::Inline(data[FILE_EXTENT_INLINE_DATA_START..].to_vec()),
            t @ (1 | 2) => {
                ensure_slice(data, 0, FILE_EXTENT_ITEM_SIZE)?;
                let disk = DiskRef {
                    disk_bytenr: read_le_u64(data, 21)?,
                    disk_num_bytes: read_le_u64(data, 29)?,
                    offset: read_le_u64(data, 37)?,
                    num_bytes: read_le_u64(data, 45)?,
                };
                if t == 1 {
                    FileExtentKind::Regular(disk)
                } else {
                    FileExtentKind::Prealloc(disk)
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "file_extent_type",
                    reason: "unknown extent type",
                });
            }
        };
        Ok(Self {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            kind,
        })
    }
}

// ── Extent item (back-references) ───────────────────────────────────────────

/// One data back-reference: `(root, ino, file_pos - extent_offset)` with a
/// count of file extent items that share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRef {
    pub root: u64,
    pub ino: u64,
    pub offset: u64,
    pub count: u32,
}

const EXTENT_REF_SIZE: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentItem {
    pub generation: u64,
    pub disk_num_bytes: u64,
    pub refs: Vec<ExtentRef>,
}

impl ExtentItem {
    /// Sum of all reference counts.
    #[must_use]
    pub fn total_refs(&self) -> u64 {
        self.refs.iter().map(|r| u64::from(r.count)).sum()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.refs.len() * EXTENT_REF_SIZE);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.disk_num_bytes.to_le_bytes());
        let n = u32::try_from(self.refs.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&n.to_le_bytes());
        for r in &self.refs {
            out.extend_from_slice(&r.root.to_le_bytes());
            out.extend_from_slice(&r.ino.to_le_bytes());
            out.extend_from_slice(&r.offset.to_le_bytes());
            out.extend_from_slice(&r.count.to_le_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let generation = read_le_u64(data, 0)?;
        let disk_num_bytes = read_le_u64(data, 8)?;
        let n = read_le_u32(data, 16)? as usize;
        ensure_slice(data, 20, n.saturating_mul(EXTENT_REF_SIZE))?;
        let mut refs = Vec::with_capacity(n);
        for i in 0..n {
            let base = 20 + i * EXTENT_REF_SIZE;
            refs.push(ExtentRef {
                root: read_le_u64(data, base)?,
                ino: read_le_u64(data, base + 8)?,
                offset: read_le_u64(data, base + 16)?,
                count: read_le_u32(data, base + 24)?,
            });
        }
        Ok(Self {
            generation,
            disk_num_bytes,
            refs,
        })
    }
}

// ── Checksum item ───────────────────────────────────────────────────────────

/// crc32c of consecutive sectors starting at the item's key offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CsumItem {
    pub sums: Vec<u32>,
}

impl CsumItem {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.sums.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "csum_item",
                reason: "length not a multiple of 4",
            });
        }
        let sums = (0..data.len() / 4)
            .map(|i| read_le_u32(data, i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sums })
    }
}

// ── Root item ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootItem {
    pub generation: u64,
    /// Generation of the most recent snapshot taken of this root.
    pub last_snapshot: u64,
    /// Next free inode number.
    pub highest_objectid: u64,
}

impl RootItem {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.last_snapshot.to_le_bytes());
        out.extend_from_slice(&self.highest_objectid.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            generation: read_le_u64(data, 0)?,
            last_snapshot: read_le_u64(data, 8)?,
            highest_objectid: read_le_u64(data, 16)?,
        })
    }
}
