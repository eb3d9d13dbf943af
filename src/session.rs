//! # Session
//!
//! A patch session opens up the pages covering a target range of memory, lets the caller rewrite bytes inside
//! that range, and puts the original protection back when it ends, whether it ends normally or on an error.
//!
//! Writes are bounds-checked against the target range, so a bad offset is an error instead of a stray write.

use std::slice;

use log::info;
use region::Protection;

use crate::error::Result;
use crate::patcher::{xor, Transform};
use crate::protect::ProtectionGuard;
use crate::window::MemoryRegion;

/// Writable view of a range of memory, open until the session is finished or dropped
pub struct PatchSession {
    /// Bytes the session may touch
    target: MemoryRegion,
    /// Keeps the covering pages open and closes them again
    access: ProtectionGuard,
}

impl PatchSession {
    /// Opens `[address, address + extent)` for patching, with the covering pages readable, writable and executable.
    ///
    /// Code sharing a page with the target keeps running, which matters when the caller patches a function living next to itself.
    ///
    /// # Safety
    ///
    /// The range must be mapped memory the caller is allowed to rewrite, no other thread may be executing
    /// the bytes being rewritten, and sessions over overlapping pages must end in the reverse order they began.
    pub unsafe fn begin(address: *const u8, extent: usize) -> Result<Self> {
        Self::begin_with(address, extent, Protection::READ_WRITE_EXECUTE)
    }

    /// Opens `[address, address + extent)` for patching with the covering pages set to `protection`
    ///
    /// # Safety
    ///
    /// See [`PatchSession::begin`]. `protection` must include write access.
    pub unsafe fn begin_with(address: *const u8, extent: usize, protection: Protection) -> Result<Self> {
        let target = MemoryRegion::new(address as usize, extent)?;
        let window = MemoryRegion::page_window(target.base(), extent)?;
        let access = ProtectionGuard::acquire(window, protection)?;
        Ok(Self { target, access })
    }

    /// Bytes the session may touch
    pub fn target(&self) -> MemoryRegion {
        self.target
    }

    /// Pages whose protection the session changed
    pub fn window(&self) -> MemoryRegion {
        self.access.window()
    }

    /// Mutable view of `len` bytes at `offset` into the target
    fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let address = self.target.offset_of(offset, len)?;
        // SAFETY: the range is inside the target, which the protection guard keeps writable
        Ok(unsafe { slice::from_raw_parts_mut(address as *mut u8, len) })
    }

    /// Copies `len` bytes at `offset` into the target
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let address = self.target.offset_of(offset, len)?;
        // SAFETY: the range is inside the target, which stays readable
        Ok(unsafe { slice::from_raw_parts(address as *const u8, len) }.to_vec())
    }

    /// Overwrites the bytes at `offset` into the target with `bytes`
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.bytes_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// XORs `len` bytes at `offset` into the target with `key`
    pub fn xor(&mut self, offset: usize, len: usize, key: u8) -> Result<()> {
        xor(self.bytes_mut(offset, len)?, key);
        Ok(())
    }

    /// Applies `transform` at `offset` into the target
    pub fn apply(&mut self, offset: usize, transform: &Transform) -> Result<()> {
        transform.apply(self.bytes_mut(offset, transform.extent())?);
        Ok(())
    }

    /// Ends the session, reporting a failure to restore the original protection
    pub fn finish(self) -> Result<()> {
        self.access.release()
    }
}

/// Applies `transform` to the code at `function + offset` and leaves it patched.
///
/// The covering pages are opened for the duration of the write and closed again before returning,
/// so afterwards `function` can be called and runs the patched bytes. Nothing here checks that the
/// result still decodes to sensible instructions.
///
/// # Safety
///
/// `function + offset` through the end of the transform must be mapped code the caller is allowed to rewrite,
/// and no thread may be executing it while it is patched.
pub unsafe fn patch(function: *const u8, offset: usize, transform: &Transform) -> Result<()> {
    let target = MemoryRegion::new(function as usize, offset)?.end() as *const u8;
    let mut session = PatchSession::begin(target, transform.extent())?;
    session.apply(0, transform)?;
    session.finish()?;
    info!(
        "patched {} byte(s) at {:p}+{:#x}",
        transform.extent(),
        function,
        offset
    );
    Ok(())
}
