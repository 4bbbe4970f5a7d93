#![forbid(unsafe_code)]
//! Error types for CowFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | Malformed metadata item payloads |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Errors surfaced to writers, readers and fsync callers |
//!
//! `cfs-error` does not depend on `cfs-types`; the `ParseError` → `CfsError`
//! conversion lives in `cfs-btree`, which owns item parsing.
//!
//! ## Propagation classes
//!
//! - **Synchronous**: `NoSpace` is returned straight to the `write()` caller
//!   after every provisional reservation for the range has been unwound.
//! - **Deferred**: `WriteFailed` is recorded on the inode's mapping-error
//!   indicator when an ordered extent completes with an IO error, and is
//!   reported by the next `fsync()`/`close()` on each handle.
//! - **Corruption**: `DataCorruption` is returned when every redundant copy
//!   of a data sector fails checksum verification. Unlike `Io`, retrying
//!   does not help.
//! - **Filesystem-wide**: `TransactionAborted` is returned by every metadata
//!   operation once a commit step failed; the filesystem is read-only from
//!   then on.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `WriteFailed` | `EIO` |
//! | `DataCorruption` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `RepairFailed` | `EIO` |
//! | `TransactionAborted` | `EROFS` |
//! | `ReadOnly` | `EROFS` |
//! | `NoSpace` | `ENOSPC` |
//! | `Exists` | `EEXIST` |
//! | `NotFound` | `ENOENT` |
//! | `InvalidArgument` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `IsDirectory` | `EISDIR` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |

use thiserror::Error;

/// Unified error type for all CowFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An earlier asynchronous write of this range failed.
    #[error("write of inode {ino} range [{start}, {end}) failed")]
    WriteFailed { ino: u64, start: u64, end: u64 },

    /// Every copy of a data sector failed checksum verification.
    #[error(
        "data corruption: inode {ino} offset {offset} logical {logical}: csum {actual:#010x} expected {expected:#010x}"
    )]
    DataCorruption {
        ino: u64,
        offset: u64,
        logical: u64,
        expected: u32,
        actual: u32,
    },

    /// Metadata corruption detected at a known location.
    #[error("corrupt metadata at {location}: {detail}")]
    Corruption { location: u64, detail: String },

    /// Mirror repair could not produce a good copy.
    #[error("repair failed: {0}")]
    RepairFailed(String),

    /// A transaction was aborted; the filesystem no longer accepts updates.
    #[error("transaction {transid} aborted: {reason}")]
    TransactionAborted { transid: u64, reason: String },

    /// Filesystem is read-only and an update was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// No device space or reservation headroom available.
    #[error("no space left on device")]
    NoSpace,

    /// An item, inode or root already exists.
    #[error("already exists")]
    Exists,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller passed an argument the operation cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration or on-disk layout.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    #[error("parse error: {0}")]
    Parse(String),

    /// Data IO attempted on a directory inode.
    #[error("is a directory")]
    IsDirectory,

    /// The operation or option is not supported by this build.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without an arm is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::WriteFailed { .. }
            | Self::DataCorruption { .. }
            | Self::Corruption { .. }
            | Self::RepairFailed(_) => libc::EIO,
            Self::TransactionAborted { .. } | Self::ReadOnly => libc::EROFS,
            Self::NoSpace => libc::ENOSPC,
            Self::Exists => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::InvalidArgument(_) | Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::IsDirectory => libc::EISDIR,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
        }
    }

    /// Whether this error means the data itself is bad, as opposed to the
    /// path to it.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::DataCorruption { .. } | Self::Corruption { .. })
    }

    /// Clone the error for fan-out to several waiters.
    ///
    /// `std::io::Error` is not `Clone`; it is rebuilt from its kind and
    /// message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(err.raw_os_error().map_or_else(
                || std::io::Error::new(err.kind(), err.to_string()),
                std::io::Error::from_raw_os_error,
            )),
            Self::WriteFailed { ino, start, end } => Self::WriteFailed {
                ino: *ino,
                start: *start,
                end: *end,
            },
            Self::DataCorruption {
                ino,
                offset,
                logical,
                expected,
                actual,
            } => Self::DataCorruption {
                ino: *ino,
                offset: *offset,
                logical: *logical,
                expected: *expected,
                actual: *actual,
            },
            Self::Corruption { location, detail } => Self::Corruption {
                location: *location,
                detail: detail.clone(),
            },
            Self::RepairFailed(s) => Self::RepairFailed(s.clone()),
            Self::TransactionAborted { transid, reason } => Self::TransactionAborted {
                transid: *transid,
                reason: reason.clone(),
            },
            Self::ReadOnly => Self::ReadOnly,
            Self::NoSpace => Self::NoSpace,
            Self::Exists => Self::Exists,
            Self::NotFound(s) => Self::NotFound(s.clone()),
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::Format(s) => Self::Format(s.clone()),
            Self::Parse(s) => Self::Parse(s.clone()),
            Self::IsDirectory => Self::IsDirectory,
            Self::UnsupportedFeature(s) => Self::UnsupportedFeature(s.clone()),
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CfsError::WriteFailed {
                    ino: 257,
                    start: 0,
                    end: 4096,
                },
                libc::EIO,
            ),
            (
                CfsError::DataCorruption {
                    ino: 257,
                    offset: 0,
                    logical: 1 << 20,
                    expected: 1,
                    actual: 2,
                },
                libc::EIO,
            ),
            (
                CfsError::Corruption {
                    location: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (CfsError::RepairFailed("test".into()), libc::EIO),
            (
                CfsError::TransactionAborted {
                    transid: 3,
                    reason: "test".into(),
                },
                libc::EROFS,
            ),
            (CfsError::ReadOnly, libc::EROFS),
            (CfsError::NoSpace, libc::ENOSPC),
            (CfsError::Exists, libc::EEXIST),
            (CfsError::NotFound("test".into()), libc::ENOENT),
            (CfsError::InvalidArgument("test".into()), libc::EINVAL),
            (CfsError::Format("test".into()), libc::EINVAL),
            (CfsError::Parse("test".into()), libc::EINVAL),
            (CfsError::IsDirectory, libc::EISDIR),
            (CfsError::UnsupportedFeature("lzo".into()), libc::EOPNOTSUPP),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
            assert_eq!(error.duplicate().to_errno(), *expected_errno);
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = CfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
        assert_eq!(err.duplicate().to_errno(), libc::EPERM);
    }

    #[test]
    fn corruption_is_distinct_from_io() {
        let corrupt = CfsError::DataCorruption {
            ino: 257,
            offset: 4096,
            logical: 1 << 20,
            expected: 0xdead_beef,
            actual: 0,
        };
        assert!(corrupt.is_corruption());
        assert!(!CfsError::Io(std::io::Error::other("x")).is_corruption());
        assert_eq!(
            corrupt.to_string(),
            "data corruption: inode 257 offset 4096 logical 1048576: csum 0x00000000 expected 0xdeadbeef"
        );
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::WriteFailed {
            ino: 300,
            start: 0,
            end: 8192,
        };
        assert_eq!(err.to_string(), "write of inode 300 range [0, 8192) failed");
        assert_eq!(CfsError::NoSpace.to_string(), "no space left on device");
        let abort = CfsError::TransactionAborted {
            transid: 9,
            reason: "csum insert failed".into(),
        };
        assert_eq!(
            abort.to_string(),
            "transaction 9 aborted: csum insert failed"
        );
    }
}
