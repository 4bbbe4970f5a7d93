#![forbid(unsafe_code)]
//! Keyed metadata store.
//!
//! Items live in a set of ordered trees under `(objectid, type, offset)`
//! keys and carry little-endian byte payloads (see [`items`]). The extent
//! engine treats the store as opaque: it reads through [`ItemReader`] and
//! writes only through a [`transaction::TransHandle`], whose staged updates
//! are applied atomically when the handle ends.
//!
//! | tree | objectid | type | offset | payload |
//! |------|----------|------|--------|---------|
//! | `Fs(root)` | inode number | `INODE_ITEM` | 0 | [`items::InodeItem`] |
//! | `Fs(root)` | inode number | `EXTENT_DATA` | file offset | [`items::FileExtentItem`] |
//! | `Extent` | disk bytenr | `EXTENT_ITEM` | disk length | [`items::ExtentItem`] |
//! | `Csum` | `EXTENT_CSUM_OBJECTID` | `EXTENT_CSUM` | disk bytenr | [`items::CsumItem`] |
//! | `Root` | root id | `ROOT_ITEM` | 0 | [`items::RootItem`] |

pub mod backref;
pub mod csum;
pub mod fs_tree;
pub mod items;
pub mod store;
pub mod transaction;

pub use store::{MetadataFaults, MetadataImage, MetadataStore, TreeKind};
pub use transaction::{TransHandle, TransactionManager};

use cfs_error::CfsError;
use cfs_types::{ParseError, RootId};
use serde::{Deserialize, Serialize};

/// Item type codes.
pub mod item_type {
    pub const INODE_ITEM: u8 = 1;
    pub const EXTENT_DATA: u8 = 108;
    pub const EXTENT_CSUM: u8 = 128;
    pub const ROOT_ITEM: u8 = 132;
    pub const EXTENT_ITEM: u8 = 168;
}

/// Objectid under which all checksum items live.
pub const EXTENT_CSUM_OBJECTID: u64 = u64::MAX - 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }
}

/// Which tree an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TreeId {
    Root,
    Extent,
    Csum,
    Fs(RootId),
}

impl TreeId {
    #[must_use]
    pub fn kind(self) -> TreeKind {
        match self {
            Self::Root => TreeKind::Root,
            Self::Extent => TreeKind::Extent,
            Self::Csum => TreeKind::Csum,
            Self::Fs(_) => TreeKind::Fs,
        }
    }
}

/// Read access shared by the committed store and open transaction handles.
pub trait ItemReader {
    fn get_item(&self, tree: TreeId, key: &Key) -> Option<Vec<u8>>;

    /// Items with `lo <= key <= hi`, in key order.
    fn range_items(&self, tree: TreeId, lo: &Key, hi: &Key) -> Vec<(Key, Vec<u8>)>;

    /// The item with the largest key `<= key`.
    fn prev_item(&self, tree: TreeId, key: &Key) -> Option<(Key, Vec<u8>)>;
}

/// Map a payload parse failure onto the runtime error taxonomy.
#[must_use]
pub fn parse_to_cfs_error(e: &ParseError) -> CfsError {
    match e {
        ParseError::InvalidField { reason, .. } if reason.contains("not supported") => {
            CfsError::UnsupportedFeature(e.to_string())
        }
        ParseError::InvalidField { .. } => CfsError::Parse(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            CfsError::Corruption {
                location: 0,
                detail: e.to_string(),
            }
        }
    }
}
