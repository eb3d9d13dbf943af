//! This module contains a patcher which adjusts memory permissions to patch read-only data and code

use log::error;
use region::Protection;
use thiserror::Error;

use super::{PatchGuard, Patcher, Transform};
use crate::protect::ProtectionGuard;
use crate::window::MemoryRegion;

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when resolving the window or setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] crate::error::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}
impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of every page the patch touches, triggering the patch, and then reverting the permissions.
///
/// The pages are made readable, writable and executable while the patch is written, so code living on the same
/// page as the patch (including the caller itself) keeps running.
///
/// # Safety
///
/// `PermissionWrapper` relies on the extent of the transform to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than that is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
    /// Protection held while writing
    protection: Protection,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper that writes with the pages readable, writable and executable
    pub fn new(patcher: P) -> Self {
        Self::with_protection(patcher, Protection::READ_WRITE_EXECUTE)
    }

    /// Creates a new PermissionWrapper that writes with the pages set to `protection`.
    ///
    /// [`Protection::READ_WRITE`] works on platforms that refuse writable and executable pages, as long as nothing
    /// executes from the patched pages while the patch is written.
    pub fn with_protection(patcher: P, protection: Protection) -> Self {
        Self {
            patcher,
            protection,
        }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// It is **NOT** safe to treat the returned value as mutable, as this function does not change memory permissions.
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        transform: &Transform,
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let window = MemoryRegion::page_window(location as usize, transform.extent())
            .map_err(PermissionError::ProtectionError)?;
        let access = ProtectionGuard::acquire(window, self.protection)
            .map_err(PermissionError::ProtectionError)?;
        let guard = self.patcher.patch(location, transform)?;
        let guard = settle(guard, access.release())?;
        Ok(PermissionWrapperGuard::guard(guard, window, self.protection))
    }
}

/// Decides what happens to a patch once its pages have been closed again.
///
/// If closing them failed partway, some pages may already be read-only, so restoring the original bytes could
/// fault. The patch is kept instead and the error returned.
fn settle<G: PatchGuard, E>(
    guard: G,
    released: crate::error::Result<()>,
) -> Result<G, PermissionError<E>> {
    match released {
        Ok(()) => Ok(guard),
        Err(e) => {
            guard.persist();
            Err(PermissionError::ProtectionError(e))
        }
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Pages covering the patch
    window: MemoryRegion,
    /// Protection to hold while restoring
    protection: Protection,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, window: MemoryRegion, protection: Protection) -> Self {
        Self {
            guard: Some(guard),
            window,
            protection,
        }
    }

    /// Get the underlying patch guard in case info is needed
    pub fn patch(&self) -> Option<&G> {
        self.guard.as_ref()
    }

    /// Pages whose protection is flipped to write and restore the patch
    pub fn window(&self) -> MemoryRegion {
        self.window
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn persist(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.persist();
        }
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };

        // SAFETY: the same change already succeeded when the patch was written
        match unsafe { ProtectionGuard::acquire(self.window, self.protection) } {
            Ok(_access) => guard.restore(),
            Err(e) => {
                // writing into pages we couldn't open up would fault, so the patch stays
                error!(
                    "failed to make 0x{:X}+{} writable to restore a patch: {}",
                    self.window.base(),
                    self.window.len(),
                    e
                );
                guard.persist();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use crate::alloc::ExecutableBuffer;
    use crate::patcher::byte::BytePatcher;
    use crate::error::Error;
    use crate::patcher::mem::{settle, to_mut, PermissionError, PermissionWrapper};
    use crate::patcher::{PatchGuard, Patcher, Transform};
    use crate::protect::query;

    #[test]
    /// Tests to ensure permissions are actually set and put back
    fn test_perms() {
        // A read+execute page. Normally, writing to this would result in a segfault, but PermissionWrapper changes the permissions to be writable so that no fault occurs
        let buffer = ExecutableBuffer::new(b"1234").unwrap();
        let ptr = buffer.as_ptr();

        // sanity check
        // make sure the data is what we expect and that the data is definitely not writable
        assert_eq!(buffer.bytes(), b"1234");
        assert_eq!(
            query(buffer.window()).unwrap().uniform(),
            Some(Protection::READ_EXECUTE)
        );

        // create the patcher and wrapper
        let patcher = BytePatcher::new();
        let wrapper = PermissionWrapper::new(patcher);

        // patch the data
        let patch = unsafe {
            wrapper
                .patch(to_mut(ptr), &Transform::Overwrite(&[4, 3, 2, 1]))
                .unwrap()
        };

        // make sure the data was actually changed
        assert_eq!(buffer.bytes(), [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        assert_eq!(
            query(buffer.window()).unwrap().uniform(),
            Some(Protection::READ_EXECUTE)
        );

        // restore the patch
        patch.restore();

        // make sure the patch was restored
        assert_eq!(buffer.bytes(), b"1234");

        // make sure permissions were restored
        assert_eq!(
            query(buffer.window()).unwrap().uniform(),
            Some(Protection::READ_EXECUTE)
        );
    }

    #[test]
    /// A failed release keeps the patch instead of writing the original bytes back
    fn test_failed_release() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patch = unsafe {
            BytePatcher::new()
                .patch(ptr, &Transform::Overwrite(&[9, 9]))
                .unwrap()
        };
        let released = Err(Error::PageAlignment {
            address: ptr as usize,
            extent: 2,
            page_size: 0,
        });

        let result = settle::<_, ()>(patch, released);
        assert!(matches!(
            result,
            Err(PermissionError::ProtectionError(Error::PageAlignment { .. }))
        ));
        assert_eq!(data, [9, 9, 3, 4]);
    }

    #[test]
    /// A successful release hands the patch back untouched
    fn test_successful_release() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patch = unsafe {
            BytePatcher::new()
                .patch(ptr, &Transform::Overwrite(&[9, 9]))
                .unwrap()
        };
        let patch = settle::<_, ()>(patch, Ok(())).unwrap();
        patch.restore();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Write-only flipping works for data nobody executes
    fn test_read_write() {
        let buffer = ExecutableBuffer::new(&[0u8; 8]).unwrap();
        let wrapper = PermissionWrapper::with_protection(BytePatcher::new(), Protection::READ_WRITE);

        let patch = unsafe {
            wrapper
                .patch(to_mut(buffer.as_ptr()), &Transform::Xor { key: 0xAA, len: 8 })
                .unwrap()
        };
        assert_eq!(buffer.bytes(), [0xAA; 8]);
        patch.persist();

        assert_eq!(buffer.bytes(), [0xAA; 8]);
        assert_eq!(
            query(buffer.window()).unwrap().uniform(),
            Some(Protection::READ_EXECUTE)
        );
    }

    #[test]
    /// A patch crossing into the next page flips both pages
    fn test_straddle() {
        let page_size = region::page::size();
        let buffer = ExecutableBuffer::new(&vec![0x11; page_size * 2]).unwrap();
        let location = unsafe { to_mut(buffer.as_ptr().add(page_size - 3)) };

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let patch = unsafe {
            wrapper
                .patch(location, &Transform::Overwrite(&[0x22; 6]))
                .unwrap()
        };
        assert_eq!(patch.window(), buffer.window());
        assert_eq!(&buffer.bytes()[page_size - 3..page_size + 3], [0x22; 6]);

        drop(patch);
        assert!(buffer.bytes().iter().all(|&b| b == 0x11));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    /// Patched code runs patched, restored code runs like before
    fn test_patch_code() {
        use crate::code::x64::{BRANCH_IMMEDIATE, RETURN_ONE};

        let buffer = ExecutableBuffer::new(&RETURN_ONE).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { buffer.entry() };
        assert_eq!(f(), 1);

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let patch = unsafe {
            wrapper
                .patch(
                    to_mut(buffer.as_ptr().add(BRANCH_IMMEDIATE)),
                    &Transform::Overwrite(&[0]),
                )
                .unwrap()
        };
        assert_eq!(f(), 0);

        patch.restore();
        assert_eq!(f(), 1);
    }
}
