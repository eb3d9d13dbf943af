//! # Patcher
//!
//! This module covers patchers, which transform bytes at a location in memory and can put the original bytes back

pub mod byte;
pub mod mem;

/// What a patch does to the bytes it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform<'a> {
    /// Replace the bytes with a literal
    Overwrite(&'a [u8]),
    /// XOR each of `len` bytes with `key`. Applying it twice is a no-op.
    Xor {
        /// Mask applied to every byte
        key: u8,
        /// Number of bytes to transform
        len: usize,
    },
}

impl Transform<'_> {
    /// Number of bytes the transform touches
    pub fn extent(&self) -> usize {
        match self {
            Self::Overwrite(bytes) => bytes.len(),
            Self::Xor { len, .. } => *len,
        }
    }

    /// Applies the transform to a buffer holding exactly [`Transform::extent`] bytes
    ///
    /// # Panics
    ///
    /// Panics if `buf` isn't exactly [`Transform::extent`] bytes long
    pub fn apply(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.extent(), "transform applied to wrong extent");
        match self {
            Self::Overwrite(bytes) => buf.copy_from_slice(bytes),
            Self::Xor { key, .. } => xor(buf, *key),
        }
    }
}

/// XORs every byte of `buf` with `key`
pub fn xor(buf: &mut [u8], key: u8) {
    buf.iter_mut().for_each(|b| *b ^= key);
}

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use `()`.
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Applies `transform` to the bytes at `target`.
    ///
    /// # Safety
    ///
    /// `target` must be valid for reads of [`Transform::extent`] bytes, plus whatever the patcher itself requires
    unsafe fn patch<'a>(
        &'a self,
        target: *mut u8,
        transform: &Transform,
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, unless `persist` was called
pub unsafe trait PatchGuard: Sized {
    /// Restores the original value of a patch
    fn restore(self) {
        // most implementations have their functionality in their [`Drop::drop`] implementation
    }

    /// Leaves the patched bytes in place and gives up the ability to restore them
    fn persist(self);
}
