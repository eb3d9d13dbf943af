//! # File
//!
//! XOR patching of byte ranges inside files on disk.
//!
//! The file is patched in place: it is never truncated or resized, and only the bytes inside the range change.
//! Nothing here locks the file, so callers must make sure only one writer touches a range at a time.

use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::patcher::xor;

/// Validated byte range `[start, end)` of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRange {
    /// First byte of the range
    start: u64,
    /// One past the last byte of the range
    end: u64,
}

impl FileRange {
    /// Creates a range, failing if `start` is past `end`
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First byte of the range
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte of the range
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Fails unless the whole range lies inside a file of `file_len` bytes
    fn check(&self, file_len: u64) -> Result<usize> {
        let out_of_bounds = || Error::OutOfBoundsPatch {
            offset: self.start,
            len: self.len(),
            limit: file_len,
        };
        if self.end > file_len {
            return Err(out_of_bounds());
        }
        usize::try_from(self.len()).map_err(|_| out_of_bounds())
    }
}

/// Reads the bytes covered by `range`, failing before anything is read if the file is too short
fn read_range(file: &mut File, path: &Path, range: FileRange) -> Result<Vec<u8>> {
    let file_len = file
        .metadata()
        .map_err(|e| Error::file("stat", path, e))?
        .len();
    let expected = range.check(file_len)?;

    file.seek(SeekFrom::Start(range.start))
        .map_err(|e| Error::file("seek in", path, e))?;

    let mut bytes = Vec::with_capacity(expected);
    let actual = file
        .take(range.len())
        .read_to_end(&mut bytes)
        .map_err(|e| Error::file("read", path, e))?;
    if actual != expected {
        return Err(Error::ShortRead {
            offset: range.start,
            expected,
            actual,
        });
    }
    Ok(bytes)
}

/// Writes `bytes` back over `range` and flushes them to disk
fn write_range(file: &mut File, path: &Path, range: FileRange, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(range.start))
        .map_err(|e| Error::file("seek in", path, e))?;
    file.write_all(bytes)
        .map_err(|e| Error::file("write", path, e))?;
    file.sync_data()
        .map_err(|e| Error::file("sync", path, e))
}

/// Opens `path` for patching in place
fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::file("open", path, e))
}

/// XORs `range` of an already open file
fn xor_file(file: &mut File, path: &Path, range: FileRange, key: u8) -> Result<()> {
    let mut staged = StagedPatch::read(file, path, range)?;
    if range.is_empty() {
        return Ok(());
    }
    staged.xor(key);
    staged.write(file, path)
}

/// XORs every byte in `[start, end)` of the file at `path` with `key`.
///
/// Applying the same call twice leaves the file as it was. If the range doesn't fit inside the file,
/// nothing is written.
pub fn xor_range(path: impl AsRef<Path>, start: u64, end: u64, key: u8) -> Result<()> {
    let path = path.as_ref();
    let range = FileRange::new(start, end)?;
    let mut file = open(path)?;

    xor_file(&mut file, path, range, key)?;
    info!(
        "xored {} byte(s) of {} at {:#x}..{:#x} with {:#04x}",
        range.len(),
        path.display(),
        start,
        end,
        key
    );
    Ok(())
}

/// Same as [`xor_range`], but a crash can't leave the file half patched.
///
/// The file is copied next to itself, the copy is patched, and the copy is renamed over the original.
pub fn xor_range_atomic(path: impl AsRef<Path>, start: u64, end: u64, key: u8) -> Result<()> {
    let path = path.as_ref();
    let range = FileRange::new(start, end)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut original = File::open(path).map_err(|e| Error::file("open", path, e))?;
    let permissions = original
        .metadata()
        .map_err(|e| Error::file("stat", path, e))?
        .permissions();

    let mut copy = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::file("create a temporary copy of", path, e))?;
    io::copy(&mut original, copy.as_file_mut())
        .map_err(|e| Error::file("copy", path, e))?;
    debug!("patching copy of {} at {}", path.display(), copy.path().display());

    xor_file(copy.as_file_mut(), path, range, key)?;

    copy.as_file()
        .set_permissions(permissions)
        .map_err(|e| Error::file("copy permissions of", path, e))?;
    copy.persist(path)
        .map_err(|e| Error::file("replace", path, e.error))?;
    info!(
        "atomically xored {} byte(s) of {} at {:#x}..{:#x} with {:#04x}",
        range.len(),
        path.display(),
        start,
        end,
        key
    );
    Ok(())
}

/// A range read out of a file, transformed in memory, and written back as a separate step.
///
/// [`xor_range`] does all three in one go. Splitting them lets callers see what happens when two
/// writers overlap without coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPatch {
    /// Range the bytes came from
    range: FileRange,
    /// Current contents of the range
    bytes: Vec<u8>,
}

impl StagedPatch {
    /// Reads `range` from an open file
    pub fn read(file: &mut File, path: &Path, range: FileRange) -> Result<Self> {
        let bytes = read_range(file, path, range)?;
        Ok(Self { range, bytes })
    }

    /// Opens `path` and reads `range` from it
    pub fn load(path: impl AsRef<Path>, range: FileRange) -> Result<Self> {
        let path = path.as_ref();
        Self::read(&mut open(path)?, path, range)
    }

    /// Range the bytes came from
    pub fn range(&self) -> FileRange {
        self.range
    }

    /// Current contents of the range
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// XORs the staged bytes with `key`
    pub fn xor(&mut self, key: u8) {
        xor(&mut self.bytes, key);
    }

    /// Writes the staged bytes back over their range of an open file
    pub fn write(&self, file: &mut File, path: &Path) -> Result<()> {
        write_range(file, path, self.range, &self.bytes)
    }

    /// Opens `path` and writes the staged bytes back over their range
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write(&mut open(path)?, path)
    }
}

/// Digest of a file's contents, for telling whether two files (or one file at two points in time) differ
pub fn checksum(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let contents = fs::read(path).map_err(|e| Error::file("read", path, e))?;
    let mut hasher = DefaultHasher::new();
    hasher.write(&contents);
    Ok(hasher.finish())
}
