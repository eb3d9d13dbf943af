//! # Window
//!
//! Resolves the page-aligned window of memory that has to change protection before a patch can be written.
//!
//! Every address computation in the crate goes through [`MemoryRegion`] so that offsets are checked
//! against the region instead of being added to raw pointers.

use log::trace;

use crate::error::{Error, Result};

/// A contiguous range of virtual memory, `[base, base + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// First address of the region
    base: usize,
    /// Number of bytes in the region
    len: usize,
}

impl MemoryRegion {
    /// Creates a region covering `[base, base + len)`.
    ///
    /// Fails when the region would wrap around the end of the address space.
    pub fn new(base: usize, len: usize) -> Result<Self> {
        match base.checked_add(len) {
            Some(_) => Ok(Self { base, len }),
            None => Err(Error::OutOfBoundsPatch {
                offset: base as u64,
                len: len as u64,
                limit: usize::MAX as u64,
            }),
        }
    }

    /// Creates a region covering the bytes of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            len: data.len(),
        }
    }

    /// Computes the page-aligned window around `[address, address + extent)` using the OS page size
    pub fn page_window(address: usize, extent: usize) -> Result<Self> {
        Self::page_window_with(address, extent, region::page::size())
    }

    /// Computes the page-aligned window around `[address, address + extent)`.
    ///
    /// The base is rounded down to a multiple of `page_size` and the length is rounded up so the
    /// window ends on the page holding the last byte of the extent. An empty extent still yields the
    /// single page containing `address`.
    pub fn page_window_with(address: usize, extent: usize, page_size: usize) -> Result<Self> {
        let misaligned = || Error::PageAlignment {
            address,
            extent,
            page_size,
        };

        if page_size == 0 {
            return Err(misaligned());
        }

        let base = address - address % page_size;
        let end = address.checked_add(extent.max(1)).ok_or_else(misaligned)?;

        // round the end up to the next page boundary
        let tail = (end - base) % page_size;
        let len = match tail {
            0 => end - base,
            _ => (end - base)
                .checked_add(page_size - tail)
                .ok_or_else(misaligned)?,
        };
        base.checked_add(len).ok_or_else(misaligned)?;

        trace!(
            "page window for 0x{:X}+{} is 0x{:X}+{} ({} page(s))",
            address,
            extent,
            base,
            len,
            len / page_size
        );
        Ok(Self { base, len })
    }

    /// First address of the region
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of bytes in the region
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the region
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    /// Base of the region as a pointer
    pub fn as_ptr(&self) -> *const u8 {
        self.base as _
    }

    /// Whether `[address, address + extent)` lies inside this region
    pub fn contains(&self, address: usize, extent: usize) -> bool {
        match address.checked_add(extent) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Whether both ends of the region fall on `page_size` boundaries
    pub fn is_page_aligned(&self, page_size: usize) -> bool {
        page_size != 0 && self.base % page_size == 0 && self.len % page_size == 0
    }

    /// Checks that `[offset, offset + extent)`, relative to the base, lies inside this region
    pub fn check(&self, offset: usize, extent: usize) -> Result<()> {
        match offset.checked_add(extent) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfBoundsPatch {
                offset: offset as u64,
                len: extent as u64,
                limit: self.len as u64,
            }),
        }
    }

    /// Returns the absolute address of `offset`, checking that `extent` bytes starting there are in bounds
    pub fn offset_of(&self, offset: usize, extent: usize) -> Result<usize> {
        self.check(offset, extent)?;
        Ok(self.base + offset)
    }

    /// Returns the sub-region `[base + offset, base + offset + extent)`
    pub fn subregion(&self, offset: usize, extent: usize) -> Result<Self> {
        let base = self.offset_of(offset, extent)?;
        Ok(Self { base, len: extent })
    }

    /// Returns the overlap of two regions, if any
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        (base < end).then(|| Self {
            base,
            len: end - base,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::window::MemoryRegion;

    /// Checks every alignment property of a resolved window
    fn assert_window(address: usize, extent: usize, page_size: usize) {
        let window = MemoryRegion::page_window_with(address, extent, page_size).unwrap();
        assert_eq!(window.base() % page_size, 0);
        assert_eq!(window.len() % page_size, 0);
        assert!(window.len() >= page_size);
        assert!(window.base() <= address);
        assert!(address < window.end());
        assert!(window.contains(address, extent));
    }

    #[test]
    /// Windows contain the full extent for a spread of addresses and page sizes
    fn test_alignment() {
        for page_size in [0x1000, 0x4000, 0x10000] {
            for address in [0x0, 0x1, 0xFFF, 0x1000, 0x1001, 0x7FFF_FFF0, 0xDEAD_BEEF] {
                for extent in [0, 1, 6, 23, page_size - 1, page_size, page_size + 1] {
                    assert_window(address, extent, page_size);
                }
            }
        }
    }

    #[test]
    /// A single byte only needs the page it lives on
    fn test_single_page() {
        let window = MemoryRegion::page_window_with(0x1234, 1, 0x1000).unwrap();
        assert_eq!(window, MemoryRegion::new(0x1000, 0x1000).unwrap());
    }

    #[test]
    /// A range crossing a page boundary covers both pages
    fn test_straddle() {
        // 23 bytes starting 10 bytes before the end of a page
        let window = MemoryRegion::page_window_with(0x1FF6, 23, 0x1000).unwrap();
        assert_eq!(window.base(), 0x1000);
        assert_eq!(window.len(), 0x2000);
        assert!(window.contains(0x1FF6, 23));
    }

    #[test]
    /// An extent ending exactly on a page boundary doesn't pull in the next page
    fn test_exact_end() {
        let window = MemoryRegion::page_window_with(0x1F00, 0x100, 0x1000).unwrap();
        assert_eq!(window, MemoryRegion::new(0x1000, 0x1000).unwrap());
    }

    #[test]
    /// Zero page sizes and windows past the end of the address space are rejected
    fn test_impossible() {
        assert!(matches!(
            MemoryRegion::page_window_with(0x1000, 1, 0),
            Err(Error::PageAlignment { .. })
        ));
        assert!(matches!(
            MemoryRegion::page_window_with(usize::MAX - 4, 16, 0x1000),
            Err(Error::PageAlignment { .. })
        ));
    }

    #[test]
    /// The OS page size is used when none is given
    fn test_os_page_size() {
        let page_size = region::page::size();
        let window = MemoryRegion::page_window(0x1234_5678, 32).unwrap();
        assert!(window.is_page_aligned(page_size));
        assert!(window.contains(0x1234_5678, 32));
    }

    #[test]
    /// Offsets are bounds-checked against the region
    fn test_bounds() {
        let region = MemoryRegion::new(0x4000, 16).unwrap();
        assert_eq!(region.offset_of(4, 12).unwrap(), 0x4004);
        assert_eq!(region.subregion(2, 3).unwrap(), MemoryRegion::new(0x4002, 3).unwrap());
        assert!(matches!(
            region.check(10, 7),
            Err(Error::OutOfBoundsPatch {
                offset: 10,
                len: 7,
                limit: 16
            })
        ));
        assert!(region.check(usize::MAX, 2).is_err());
        assert!(MemoryRegion::new(usize::MAX, 2).is_err());
    }

    #[test]
    /// Intersections clip to the shared bytes
    fn test_intersect() {
        let a = MemoryRegion::new(0x1000, 0x2000).unwrap();
        let b = MemoryRegion::new(0x2800, 0x1000).unwrap();
        assert_eq!(a.intersect(&b), Some(MemoryRegion::new(0x2800, 0x800).unwrap()));
        assert_eq!(a.intersect(&MemoryRegion::new(0x3000, 1).unwrap()), None);
    }
}
