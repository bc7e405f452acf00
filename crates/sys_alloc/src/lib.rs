//! Anonymous page mappings for relocatable arenas.
//!
//! An arena that outgrows its buffer allocates a fresh mapping, copies the
//! used bytes across and drops the old one. When it shrinks without moving it
//! can hand the pages past its new end back to the OS with
//! [`Mapping::discard`].

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` on overflow.
#[must_use]
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// An anonymous, private, read-write memory mapping.
///
/// The pages are unmapped when this value is dropped. Fresh mappings are
/// zero-filled by the OS.
pub struct Mapping {
    inner: os::MappingInner,
}

impl Mapping {
    /// Returns a pointer to the first byte of the mapping.
    ///
    /// The pointer is page aligned.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes (a multiple of the page size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Releases the physical pages backing `[offset, offset + len)`.
    ///
    /// The range is shrunk inward to whole pages; partial pages at either end
    /// are left untouched. The address range stays mapped and readable, but
    /// the bytes in discarded pages are unspecified until written again.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the advice call fails, or `InvalidInput` if the
    /// range lies outside the mapping.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range outside mapping"))?;

        let page = page_size();
        let first = offset.next_multiple_of(page);
        let last = end & !(page - 1);
        if first >= last {
            return Ok(());
        }

        // SAFETY: `[first, last)` is page aligned and lies inside this mapping.
        unsafe { self.inner.discard(first, last - first) }
    }
}

// SAFETY: the mapping is plain memory owned by this value; it carries no
// thread affinity.
unsafe impl Send for Mapping {}
// SAFETY: shared access only hands out the base pointer and length.
unsafe impl Sync for Mapping {}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Builder for [`Mapping`].
#[derive(Debug, Clone)]
pub struct MapOptions {
    len: usize,
    populate: bool,
}

impl MapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the requested length in bytes. It is rounded up to whole pages.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Pre-fault the page tables (`MAP_POPULATE` on Linux, ignored elsewhere).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates an anonymous mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length, otherwise the
    /// OS error reported by the mapping call.
    pub fn map(&self) -> io::Result<Mapping> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = round_to_pages(self.len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflows"))?;

        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let inner = unsafe { os::MappingInner::map_anon(len, self.populate)? };
        Ok(Mapping { inner })
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::new()
    }
}
