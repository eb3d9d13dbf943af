//! # Error
//!
//! Errors shared by the window resolver, the protection flipper and both byte patchers

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can abort a patch attempt
#[derive(Debug, Error)]
pub enum Error {
    /// The page window around `address` can't be computed
    #[error("cannot compute page window for 0x{address:X}+{extent} with page size {page_size}")]
    PageAlignment {
        /// Requested address
        address: usize,
        /// Number of bytes that had to be covered
        extent: usize,
        /// Page size used for the computation
        page_size: usize,
    },
    /// The OS refused to change the protection of a region
    #[error("failed to set protection {protection:?} on 0x{base:X}+{len}")]
    ProtectionChange {
        /// Base of the region
        base: usize,
        /// Length of the region
        len: usize,
        /// Protection that was requested
        protection: region::Protection,
        /// Underlying OS error
        #[source]
        source: region::Error,
    },
    /// Looking up the current protection of a region failed
    #[error("failed to query protection of 0x{base:X}+{len}")]
    Query {
        /// Base of the region
        base: usize,
        /// Length of the region
        len: usize,
        /// Underlying OS error
        #[source]
        source: region::Error,
    },
    /// The patch would touch bytes outside of its target
    #[error("patch at offset {offset} of {len} bytes exceeds limit of {limit} bytes")]
    OutOfBoundsPatch {
        /// Start of the patch
        offset: u64,
        /// Number of bytes in the patch
        len: u64,
        /// Size of the target
        limit: u64,
    },
    /// A start offset lies past its end offset
    #[error("invalid range: start offset {start} is past end offset {end}")]
    InvalidRange {
        /// Start offset
        start: u64,
        /// End offset
        end: u64,
    },
    /// Opening, seeking, reading or writing a file failed
    #[error("failed to {op} {}", .path.display())]
    FileAccess {
        /// Operation that failed
        op: &'static str,
        /// File being patched
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Fewer bytes were available than the range asked for
    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Offset the read started at
        offset: u64,
        /// Bytes requested
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },
    /// Mapping anonymous memory failed
    #[error("failed to map {len} bytes: {error}")]
    Map {
        /// Requested mapping length
        len: usize,
        /// Underlying mapping error
        error: mmap::MapError,
    },
}

impl Error {
    /// Wraps an IO error with the operation and path it came from
    pub(crate) fn file(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileAccess {
            op,
            path: path.into(),
            source,
        }
    }
}
