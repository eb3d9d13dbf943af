//! This module contains a byte patcher

use std::slice;

use super::{PatchGuard, Patcher, Transform};

/// Patcher that writes straight to the target.
/// This patcher never fails, but the target has to be writable already.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = ();
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        transform: &Transform,
    ) -> Result<Self::Guard<'a>, Self::Error> {
        Ok(BytePatchGuard::patch(location, transform))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Original data from `location`. `None` once the patch has been restored or persisted
    original: Option<Vec<u8>>,
    /// Location of the patch
    location: *mut u8,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid and writable for `transform.extent()` bytes
    unsafe fn patch(location: *mut u8, transform: &Transform) -> Self {
        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        let target = slice::from_raw_parts_mut(location, transform.extent());
        let original = target.to_vec();

        // Safety: caller must ensure that `location` is writable
        transform.apply(target);

        Self {
            original: Some(original),
            location,
        }
    }

    /// Bytes that were at the location before it was patched
    pub fn original(&self) -> &[u8] {
        self.original.as_deref().unwrap_or_default()
    }

    /// Location of the patch
    pub fn location(&self) -> *const u8 {
        self.location
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn persist(mut self) {
        self.original = None;
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
            unsafe { slice::from_raw_parts_mut(self.location, original.len()) }
                .copy_from_slice(&original);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher, Transform};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the data
        let patch = unsafe {
            patcher
                .patch(ptr, &Transform::Overwrite(&[4, 3, 2, 1]))
                .unwrap()
        };
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        // make sure the data was actually changed
        assert_eq!(unsafe { *ptr.add(0) }, 4);
        assert_eq!(unsafe { *ptr.add(3) }, 1);

        // restore the patch
        patch.restore();

        // make sure the patch was restored
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();

        // XOR the middle two bytes
        let patch = unsafe {
            patcher
                .patch(ptr.wrapping_add(1), &Transform::Xor { key: 0xFF, len: 2 })
                .unwrap()
        };
        assert_eq!(
            unsafe { std::slice::from_raw_parts(ptr, 4) },
            [1, 0xFD, 0xFC, 4]
        );

        drop(patch);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Persisted patches survive the guard
    fn test_persist() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &Transform::Overwrite(&[0])).unwrap() };
        patch.persist();

        assert_eq!(data, [0, 2, 3, 4]);
    }

    #[test]
    /// XOR transforms undo themselves
    fn test_xor_self_inverse() {
        let original = *b"Hello, world!";
        let mut buf = original;
        let transform = Transform::Xor {
            key: b'k',
            len: buf.len(),
        };

        transform.apply(&mut buf);
        assert_ne!(buf, original);
        transform.apply(&mut buf);
        assert_eq!(buf, original);
    }
}
