#![forbid(unsafe_code)]
//! Shared newtypes, size constants and little-endian parse helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default data sector size.
pub const DEFAULT_SECTORSIZE: u32 = 4096;
/// Default metadata node size.
pub const DEFAULT_NODESIZE: u32 = 16 * 1024;

/// Largest extent a single allocation may produce.
///
/// Outstanding-extent accounting charges one credit per `MAX_EXTENT_SIZE`
/// bytes of delalloc, rounded up.
pub const MAX_EXTENT_SIZE: u64 = 128 * 1024 * 1024;

/// Largest on-disk size of one compressed extent.
pub const MAX_COMPRESSED: u64 = 128 * 1024;
/// Largest uncompressed span covered by one compressed extent.
pub const MAX_UNCOMPRESSED: u64 = 128 * 1024;
/// Span of file data handed to one async compression job.
pub const ASYNC_CHUNK_SIZE: u64 = 512 * 1024;

/// Default `max_inline` mount option.
pub const DEFAULT_MAX_INLINE: u64 = 2048;

/// Size of a metadata node header.
pub const NODE_HEADER_SIZE: u32 = 101;
/// Size of one leaf item descriptor.
pub const LEAF_ITEM_SIZE: u32 = 25;
/// Bytes of a file extent item that precede inline data.
pub const FILE_EXTENT_INLINE_DATA_START: usize = 21;
/// Full size of a non-inline file extent item.
pub const FILE_EXTENT_ITEM_SIZE: usize = 53;

/// Largest payload a single leaf item can carry for a given node size.
#[must_use]
pub fn max_item_size(nodesize: u32) -> u64 {
    u64::from(nodesize.saturating_sub(NODE_HEADER_SIZE + LEAF_ITEM_SIZE))
}

/// Largest inline data payload for a given node size.
#[must_use]
pub fn max_inline_data_size(nodesize: u32) -> u64 {
    max_item_size(nodesize).saturating_sub(FILE_EXTENT_INLINE_DATA_START as u64)
}

/// Worst-case number of extents needed to store `size` bytes.
#[must_use]
pub fn count_max_extents(size: u64, max_extent_size: u64) -> u64 {
    if max_extent_size == 0 {
        return 0;
    }
    size.div_ceil(max_extent_size)
}

/// Exclusive end of `[start, start + len)`, saturating at `u64::MAX`.
///
/// `len == u64::MAX` is the "to end of address space" sentinel.
#[must_use]
pub fn range_end(start: u64, len: u64) -> u64 {
    start.saturating_add(len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// Directory inode of every subvolume root.
    pub const ROOT_DIR: Self = Self(256);
    /// First objectid handed out for regular inodes.
    pub const FIRST_FREE: Self = Self(257);
}

/// Subvolume (file tree) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RootId(pub u64);

impl RootId {
    /// Default subvolume created at mount.
    pub const FS_TREE: Self = Self(5);
    /// First id for user-created subvolumes and snapshots.
    pub const FIRST_FREE: Self = Self(256);
}

/// Transaction id a structure was last modified in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Validated data sector size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorSize(u32);

impl SectorSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn bytes(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of bits to shift to convert between bytes and sectors.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    #[must_use]
    pub fn round_down(self, value: u64) -> u64 {
        value & !(self.bytes() - 1)
    }

    /// Round up to the next sector boundary, saturating at the last
    /// aligned value below `u64::MAX`.
    #[must_use]
    pub fn round_up(self, value: u64) -> u64 {
        align_up(value, self.bytes()).unwrap_or_else(|| self.round_down(u64::MAX))
    }

    #[must_use]
    pub fn is_aligned(self, value: u64) -> bool {
        value & (self.bytes() - 1) == 0
    }

    /// Number of sectors needed to cover `len` bytes.
    #[must_use]
    pub fn sectors(self, len: u64) -> u64 {
        len.div_ceil(self.bytes())
    }
}

impl Default for SectorSize {
    fn default() -> Self {
        Self(DEFAULT_SECTORSIZE)
    }
}

/// Data compression algorithm recorded in file extent items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Zlib,
    Zstd,
}

impl CompressionType {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Zstd => 3,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Err(ParseError::InvalidField {
                field: "compression",
                reason: "lzo is not supported",
            }),
            3 => Ok(Self::Zstd),
            _ => Err(ParseError::InvalidField {
                field: "compression",
                reason: "unknown compression type",
            }),
        }
    }

    #[must_use]
    pub fn is_compressed(self) -> bool {
        self != Self::None
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
