//! # Protect
//!
//! Changes page protections over a [`MemoryRegion`] and puts them back afterwards.
//!
//! Each query-then-change step is serialized behind one process-wide lock, so two threads can't both snapshot
//! a window halfway through the other's change. The lock is never held between steps, so a live
//! [`ProtectionGuard`] doesn't stop the same thread from changing protections again.

use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::{debug, error};
use region::Protection;

use crate::error::{Error, Result};
use crate::window::MemoryRegion;

lazy_static! {
    /// Held while a window is queried and changed, or while it is restored
    static ref PROTECTION_LOCK: Mutex<()> = Mutex::new(());
}

/// Takes the protection lock. A panic while holding it doesn't leave the pages in a worse state, so poisoning is ignored.
fn lock() -> MutexGuard<'static, ()> {
    PROTECTION_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Protection that was in effect over a window before it was changed.
///
/// A window can span several mappings, so this keeps one entry per span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousProtection {
    /// Each span of the window with its protection
    spans: Vec<(MemoryRegion, Protection)>,
}

impl PreviousProtection {
    /// Each span of the window together with its protection
    pub fn spans(&self) -> &[(MemoryRegion, Protection)] {
        &self.spans
    }

    /// The protection of the whole window, if every span shares it
    pub fn uniform(&self) -> Option<Protection> {
        let (_, first) = self.spans.first()?;
        self.spans
            .iter()
            .all(|(_, p)| p == first)
            .then_some(*first)
    }

    /// Puts every span back to the protection it had.
    ///
    /// # Safety
    ///
    /// Nothing may rely on the protection currently in effect over these spans
    unsafe fn restore(&self) -> Result<()> {
        let _lock = lock();
        self.restore_locked()
    }

    /// Same as [`PreviousProtection::restore`], for callers already holding the lock
    ///
    /// # Safety
    ///
    /// See [`PreviousProtection::restore`]
    unsafe fn restore_locked(&self) -> Result<()> {
        for (span, protection) in &self.spans {
            protect(*span, *protection)?;
        }
        Ok(())
    }
}

/// Reads the protection currently in effect over `window`.
///
/// Fails with [`Error::Query`] if any byte of the window is unmapped.
pub fn query(window: MemoryRegion) -> Result<PreviousProtection> {
    let query_error = |source| Error::Query {
        base: window.base(),
        len: window.len(),
        source,
    };

    let mut spans = Vec::new();
    let mut covered = window.base();
    for mapping in region::query_range(window.as_ptr(), window.len()).map_err(query_error)? {
        let mapping = mapping.map_err(query_error)?;
        let protection = mapping.protection();
        let range = mapping.as_range();
        let mapping = MemoryRegion::new(range.start, range.end - range.start)?;

        let Some(span) = mapping.intersect(&window) else {
            continue;
        };
        if span.base() != covered {
            // hole between two mappings
            break;
        }
        covered = span.end();
        spans.push((span, protection));
    }

    if covered < window.end() {
        return Err(query_error(region::Error::UnmappedRegion));
    }
    Ok(PreviousProtection { spans })
}

/// Issues the protection change for `window`
///
/// # Safety
///
/// See [`set_protection`]
unsafe fn protect(window: MemoryRegion, protection: Protection) -> Result<()> {
    debug!(
        "protecting 0x{:X}+{} as {:?}",
        window.base(),
        window.len(),
        protection
    );
    region::protect(window.as_ptr(), window.len(), protection).map_err(|source| {
        Error::ProtectionChange {
            base: window.base(),
            len: window.len(),
            protection,
            source,
        }
    })
}

/// Changes `window` to `protection` without taking the lock
///
/// # Safety
///
/// See [`set_protection`]
unsafe fn set_protection_locked(
    window: MemoryRegion,
    protection: Protection,
) -> Result<PreviousProtection> {
    let page_size = region::page::size();
    if !window.is_page_aligned(page_size) {
        return Err(Error::PageAlignment {
            address: window.base(),
            extent: window.len(),
            page_size,
        });
    }

    let previous = query(window)?;
    if previous.uniform() == Some(protection) {
        debug!(
            "0x{:X}+{} is already {:?}",
            window.base(),
            window.len(),
            protection
        );
        return Ok(previous);
    }

    if let Err(e) = protect(window, protection) {
        // the change may have landed on some spans before failing
        if let Err(restore) = previous.restore_locked() {
            error!("failed to undo partial protection change: {}", restore);
        }
        return Err(e);
    }
    Ok(previous)
}

/// Sets the protection of a page-aligned `window` and returns what it was before.
///
/// Requesting the protection the window already has is a no-op.
///
/// # Safety
///
/// Removing permissions from memory that is still in use (the running code, the stack, live data) will fault.
/// Adding write permission to code lets it be overwritten; the caller is responsible for restoring it.
pub unsafe fn set_protection(
    window: MemoryRegion,
    protection: Protection,
) -> Result<PreviousProtection> {
    let _lock = lock();
    set_protection_locked(window, protection)
}

/// Scoped protection change: the original protection comes back when the guard is released or dropped.
///
/// Guards over overlapping windows should be released in the reverse order they were acquired.
pub struct ProtectionGuard {
    /// Window whose protection was changed
    window: MemoryRegion,
    /// Protection to put back. `None` once it has been restored
    previous: Option<PreviousProtection>,
}

impl ProtectionGuard {
    /// Changes `window` to `protection` until the guard goes away.
    ///
    /// Fails without changing anything if the OS refuses the change.
    ///
    /// # Safety
    ///
    /// See [`set_protection`]
    pub unsafe fn acquire(window: MemoryRegion, protection: Protection) -> Result<Self> {
        let previous = set_protection(window, protection)?;
        Ok(Self {
            window,
            previous: Some(previous),
        })
    }

    /// Window covered by this guard
    pub fn window(&self) -> MemoryRegion {
        self.window
    }

    /// Protection the window had before the guard was acquired
    pub fn previous(&self) -> Option<&PreviousProtection> {
        self.previous.as_ref()
    }

    /// Restores the original protection, reporting failure instead of logging it
    pub fn release(mut self) -> Result<()> {
        match self.previous.take() {
            // SAFETY: we're returning the window to the state it was in before we touched it
            Some(previous) => unsafe { previous.restore() },
            None => Ok(()),
        }
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // SAFETY: we're returning the window to the state it was in before we touched it
            if let Err(e) = unsafe { previous.restore() } {
                error!(
                    "failed to restore protection of 0x{:X}+{}: {}",
                    self.window.base(),
                    self.window.len(),
                    e
                );
            }
        }
    }
}
