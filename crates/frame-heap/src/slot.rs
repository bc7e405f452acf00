//! Slot headers and in-place slot teardown.
//!
//! Every allocation in a frame is a slot: a fixed [`SlotHeader`] followed by
//! the payload. Slots are laid out back to back, so the next header lives at
//! `header + HEADER_SIZE + size`. Both the header and the payload start on a
//! [`SLOT_ALIGN`] boundary.

use std::ptr;

use crate::record::TrackingRecord;
use crate::registry::SlotVTable;

/// Alignment of every slot header and payload.
pub const SLOT_ALIGN: usize = 16;

/// Bytes occupied by a slot header in front of each payload.
pub const HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

pub(crate) const IN_USE: u32 = 1;
pub(crate) const FINALIZED: u32 = 1 << 1;

/// Bookkeeping stored in front of each payload.
///
/// An all-zero header is an empty slot of size 0.
#[repr(C, align(16))]
pub(crate) struct SlotHeader {
    /// Payload size in bytes, a multiple of [`SLOT_ALIGN`].
    pub(crate) size: usize,
    pub(crate) flags: u32,
    /// Copy of the vtable's tag, so raw dumps can be read without the registry.
    pub(crate) tag: u32,
    pub(crate) vtable: *const SlotVTable,
    pub(crate) record: *const TrackingRecord,
}

const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE % SLOT_ALIGN == 0);

/// Rounds a payload request up to the slot alignment.
pub(crate) const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(SLOT_ALIGN - 1) {
        Some(n) => Some(n & !(SLOT_ALIGN - 1)),
        None => None,
    }
}

/// Turns an address inside the arena back into a pointer.
///
/// The arena exposes the provenance of its backing buffer when it is
/// allocated, so addresses stored as integers stay dereferenceable.
#[inline]
pub(crate) fn ptr_at(addr: usize) -> *mut u8 {
    ptr::with_exposed_provenance_mut(addr)
}

#[inline]
pub(crate) fn header_at(addr: usize) -> *mut SlotHeader {
    ptr_at(addr).cast::<SlotHeader>()
}

#[inline]
pub(crate) const fn payload_addr(header_addr: usize) -> usize {
    header_addr + HEADER_SIZE
}

/// Writes a fresh in-use header for an untyped payload of `size` bytes.
///
/// # Safety
///
/// `header_addr` must be aligned and `HEADER_SIZE + size` bytes must be
/// writable there.
pub(crate) unsafe fn init(header_addr: usize, size: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        header_at(header_addr).write(SlotHeader {
            size,
            flags: IN_USE,
            tag: 0,
            vtable: ptr::null(),
            record: ptr::null(),
        });
    }
}

/// Binds a registered type to a slot.
///
/// # Safety
///
/// `header` must point at a live slot header.
pub(crate) unsafe fn set_type(header: *mut SlotHeader, vtable: &'static SlotVTable) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        (*header).vtable = vtable;
        (*header).tag = vtable.tag().0;
    }
}

/// Whether teardown may keep a non-collectable payload alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Last handle released or explicit destroy: honor `is_collectable`.
    Release,
    /// The frame itself is being cleared: always drop.
    Reclaim,
}

/// Runs the destroy callback of one slot in place.
///
/// Managed payloads are finalized first (at most once over the slot's life).
/// A payload is then dropped, its bytes zeroed and the header marked free,
/// unless `mode` is [`Teardown::Release`] and the payload reports itself as
/// not collectable. The slot's tracking record is invalidated and unlinked
/// before any user code runs.
///
/// Returns the payload size released, or 0 if the slot was kept or already
/// free.
///
/// # Safety
///
/// `header` must point at a slot header inside a live frame, and no
/// references into the payload may be live.
pub(crate) unsafe fn destroy(header: *mut SlotHeader, mode: Teardown) -> usize {
    // SAFETY: the caller guarantees `header` is a valid slot header. Fields
    // are read through the raw pointer on every access because user code run
    // below may re-enter and tear down other slots.
    unsafe {
        if (*header).flags & IN_USE == 0 {
            return 0;
        }

        let record = (*header).record;
        (*header).record = ptr::null();
        if !record.is_null() {
            (*record).invalidate();
        }

        let payload = header.cast::<u8>().add(HEADER_SIZE);
        let vtable = (*header).vtable;

        if let Some(vtable) = vtable.as_ref() {
            if let Some(managed) = vtable.managed {
                if (*header).flags & FINALIZED == 0 {
                    (*header).flags |= FINALIZED;
                    (managed.finalize)(payload);
                }
                if mode == Teardown::Release && !(managed.is_collectable)(payload) {
                    return 0;
                }
            }
        }

        let size = (*header).size;
        (*header).flags = 0;
        (*header).vtable = ptr::null();
        (*header).tag = 0;
        if let Some(vtable) = vtable.as_ref() {
            (vtable.drop_fn)(payload);
        }
        ptr::write_bytes(payload, 0, size);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), Some(0));
        assert_eq!(round_up(1), Some(16));
        assert_eq!(round_up(16), Some(16));
        assert_eq!(round_up(17), Some(32));
        assert_eq!(round_up(usize::MAX), None);
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(std::mem::align_of::<SlotHeader>(), SLOT_ALIGN);
    }

    #[repr(align(16))]
    struct Block([u8; 96]);

    #[test]
    fn test_destroy_untyped_slot_zeroes_payload() {
        let mut block = Block([0; 96]);
        let base = block.0.as_mut_ptr().expose_provenance();
        // SAFETY: the block is aligned and large enough for a 64-byte slot.
        unsafe {
            init(base, 64);
            ptr_at(payload_addr(base)).write_bytes(0xAB, 64);
            let header = header_at(base);
            assert_eq!(destroy(header, Teardown::Release), 64);
            assert_eq!((*header).flags, 0);
            assert_eq!((*header).size, 64);
            assert_eq!(destroy(header, Teardown::Release), 0);
        }
        assert!(block.0[HEADER_SIZE..].iter().all(|&b| b == 0));
    }
}
