//! Allocates executable buffers holding caller-supplied machine code
//!
//! The buffer starts out writable so the code can be copied in, then gets flipped to read+execute,
//! which leaves it in the same state as a page of a binary's `.text` section.

use std::{mem, ptr, slice};

use log::debug;
use region::Protection;

use crate::error::{Error, Result};
use crate::protect::set_protection;
use crate::window::MemoryRegion;

/// Anonymous read+execute mapping containing a copy of some code
pub struct ExecutableBuffer {
    /// Backing memory map, unmapped on drop
    map: mmap::MemoryMap,
    /// Number of code bytes at the start of the map
    len: usize,
}

impl ExecutableBuffer {
    /// Maps enough pages to hold `code`, copies it in, and makes the pages read+execute
    pub fn new(code: &[u8]) -> Result<Self> {
        let size = MemoryRegion::page_window(0, code.len())?.len();
        let map = mmap::MemoryMap::new(
            size,
            &[mmap::MapOption::MapReadable, mmap::MapOption::MapWritable],
        )
        .map_err(|error| Error::Map { len: size, error })?;

        // SAFETY: the map was just created writable and is at least `code.len()` bytes long
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), map.data(), code.len()) };

        let buffer = Self {
            map,
            len: code.len(),
        };
        // SAFETY: nothing else knows about this mapping yet
        unsafe { set_protection(buffer.window(), Protection::READ_EXECUTE)? };

        debug!(
            "mapped {} code bytes at {:p}",
            buffer.len,
            buffer.as_ptr()
        );
        Ok(buffer)
    }

    /// Pointer to the first code byte
    pub fn as_ptr(&self) -> *const u8 {
        self.map.data()
    }

    /// Number of code bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no code
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Region covering just the code bytes
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::from_slice(self.bytes())
    }

    /// Region covering the whole mapping, always page aligned
    pub fn window(&self) -> MemoryRegion {
        // a live mapping never wraps the address space
        MemoryRegion::from_slice(unsafe { slice::from_raw_parts(self.map.data(), self.map.len()) })
    }

    /// Current contents of the code bytes
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is always readable and holds `len` bytes
        unsafe { slice::from_raw_parts(self.map.data(), self.len) }
    }

    /// Reinterprets the start of the buffer as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type whose signature and ABI match the code in the buffer,
    /// and the returned pointer must not outlive the buffer
    pub unsafe fn entry<F: Copy>(&self) -> F {
        assert_eq!(mem::size_of::<F>(), mem::size_of::<*const u8>());
        let ptr = self.as_ptr();
        mem::transmute_copy(&ptr)
    }
}
