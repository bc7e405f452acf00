//! Memory an arena lives in.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use sys_alloc::{MapOptions, Mapping};

use crate::config::BackingKind;
use crate::error::{ArenaError, Result};
use crate::slot::SLOT_ALIGN;

pub(crate) enum Backing {
    /// Zero capacity; the base is a dangling aligned address.
    Empty,
    Heap {
        ptr: NonNull<u8>,
        layout: Layout,
    },
    Mapped(Mapping),
    /// Caller-provided memory. Never freed, never moved.
    External {
        ptr: NonNull<u8>,
        len: usize,
    },
}

impl Backing {
    /// Allocates at least `capacity` bytes.
    ///
    /// Heap allocation failure aborts through `handle_alloc_error`, the same
    /// as any other allocation in the process.
    pub(crate) fn allocate(kind: BackingKind, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::Empty);
        }
        let exhausted = || ArenaError::Exhausted {
            requested: capacity,
            capacity: 0,
        };
        let backing = match kind {
            BackingKind::Heap => {
                let layout = Layout::from_size_align(capacity, SLOT_ALIGN).map_err(|_| exhausted())?;
                // SAFETY: layout has non-zero size.
                let ptr = unsafe { alloc::alloc(layout) };
                let Some(ptr) = NonNull::new(ptr) else {
                    alloc::handle_alloc_error(layout);
                };
                Self::Heap { ptr, layout }
            }
            BackingKind::Mapped => {
                let mapping = MapOptions::new().len(capacity).map().map_err(|_| exhausted())?;
                Self::Mapped(mapping)
            }
        };
        // Addresses are stored as integers from here on.
        let _ = backing.as_ptr().expose_provenance();
        Ok(backing)
    }

    /// Wraps caller memory, aligning the start up to the slot alignment.
    pub(crate) fn external(ptr: NonNull<u8>, len: usize) -> Self {
        let skip = ptr.as_ptr().align_offset(SLOT_ALIGN).min(len);
        let usable = (len - skip) & !(SLOT_ALIGN - 1);
        // SAFETY: `skip <= len`, so the result stays inside the caller's buffer.
        let ptr = unsafe { ptr.add(skip) };
        let _ = ptr.as_ptr().expose_provenance();
        Self::External { ptr, len: usable }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Self::Empty => std::ptr::without_provenance_mut(SLOT_ALIGN),
            Self::Heap { ptr, .. } | Self::External { ptr, .. } => ptr.as_ptr(),
            Self::Mapped(mapping) => mapping.as_ptr(),
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.as_ptr().addr()
    }

    /// Bytes that can be used without reallocating.
    pub(crate) fn limit(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Heap { layout, .. } => layout.size(),
            Self::Mapped(mapping) => mapping.len(),
            Self::External { len, .. } => *len,
        }
    }

    /// Whether the arena may move to a different buffer.
    pub(crate) const fn is_relocatable(&self) -> bool {
        !matches!(self, Self::External { .. })
    }

    /// Returns the pages past `offset` to the OS, if the backing supports it.
    pub(crate) fn discard_from(&self, offset: usize) -> bool {
        match self {
            Self::Mapped(mapping) if offset < mapping.len() => {
                mapping.discard(offset, mapping.len() - offset).is_ok()
            }
            _ => false,
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Self::Heap { ptr, layout } = self {
            // SAFETY: allocated in `allocate` with this layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}
