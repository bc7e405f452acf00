//! Frames: contiguous, stack-ordered sub-ranges of an arena.
//!
//! A frame owns `[base, end)`. Slots are bump-allocated from `base` up to
//! `top`; `[top, end)` is free. Destroyed slots stay in place as holes until
//! the frame is defragmented.

use std::ptr;

use crate::arena::FrameId;
use crate::locator::{Locator, MoveDirection};
use crate::slot::{self, SlotHeader, Teardown, FINALIZED, HEADER_SIZE, IN_USE};

pub(crate) struct Region {
    pub(crate) id: FrameId,
    pub(crate) base: usize,
    pub(crate) end: usize,
    pub(crate) top: usize,
    /// Free bytes a trim leaves behind.
    pub(crate) trim_reserve: usize,
    /// Whether `[top, end)` is known to be zero.
    pub(crate) blanked: bool,
    pub(crate) live: bool,
}

/// Walks slot headers from `base` to `top`.
pub(crate) struct SlotCursor {
    cursor: usize,
    top: usize,
}

impl Iterator for SlotCursor {
    type Item = *mut SlotHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.top {
            return None;
        }
        let header = slot::header_at(self.cursor);
        // SAFETY: every byte in `[base, top)` belongs to a slot, so the
        // cursor always lands on a header.
        self.cursor += HEADER_SIZE + unsafe { (*header).size };
        Some(header)
    }
}

/// What a defragment pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Compaction {
    pub(crate) moved: usize,
    pub(crate) reclaimed: usize,
    pub(crate) rebased: usize,
}

impl Region {
    pub(crate) const fn new(id: FrameId, base: usize, end: usize, trim_reserve: usize) -> Self {
        Self {
            id,
            base,
            end,
            top: base,
            trim_reserve,
            blanked: false,
            live: true,
        }
    }

    pub(crate) const fn used(&self) -> usize {
        self.top - self.base
    }

    pub(crate) const fn available(&self) -> usize {
        self.end - self.top
    }

    pub(crate) const fn len(&self) -> usize {
        self.end - self.base
    }

    pub(crate) const fn slots(&self) -> SlotCursor {
        SlotCursor {
            cursor: self.base,
            top: self.top,
        }
    }

    /// Carves a new slot with a `size`-byte payload off the free tail.
    ///
    /// Returns the payload address.
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of the slot alignment and
    /// `HEADER_SIZE + size <= self.available()`.
    pub(crate) unsafe fn bump(&mut self, size: usize) -> usize {
        debug_assert!(HEADER_SIZE + size <= self.available());
        let header = self.top;
        // SAFETY: guaranteed by the caller.
        unsafe { slot::init(header, size) };
        self.top += HEADER_SIZE + size;
        slot::payload_addr(header)
    }

    /// Finds the slot whose payload starts at `payload`, in use or freed.
    pub(crate) fn slot_at(&self, payload: usize) -> Option<*mut SlotHeader> {
        // Header-only slots put their payload address right at `top`.
        if payload < self.base + HEADER_SIZE || payload > self.top {
            return None;
        }
        self.slots()
            .find(|&header| slot::payload_addr(header.addr()) == payload)
    }

    /// Finds the in-use slot whose payload starts at `payload`.
    pub(crate) fn find(&self, payload: usize) -> Option<*mut SlotHeader> {
        self.slot_at(payload).filter(|&header| {
            // SAFETY: `slot_at` only yields headers of this frame.
            unsafe { (*header).flags & IN_USE != 0 }
        })
    }

    /// Destroys the slot whose payload starts at `payload`.
    ///
    /// Returns the bytes released and whether the slot held a payload
    /// before the call; a freed slot releases 0. `None` if no slot starts
    /// there.
    ///
    /// # Safety
    ///
    /// No references into the payload may be live.
    pub(crate) unsafe fn destroy(&mut self, payload: usize) -> Option<(usize, bool)> {
        let header = self.slot_at(payload)?;
        // SAFETY: `slot_at` returned a header of this frame.
        unsafe {
            let was_live = (*header).flags & IN_USE != 0;
            Some((slot::destroy(header, Teardown::Release), was_live))
        }
    }

    /// Slides live slots down over holes in one pass.
    ///
    /// Moved slots have their records rebased; the vacated tail is zeroed.
    ///
    /// # Safety
    ///
    /// No references into the frame may be live.
    pub(crate) unsafe fn defrag(&mut self) -> Compaction {
        let mut stats = Compaction::default();
        let mut read = self.base;
        let mut write = self.base;

        while read < self.top {
            let header = slot::header_at(read);
            // SAFETY: `read` always lands on a header inside `[base, top)`.
            let (span, in_use) = unsafe { (HEADER_SIZE + (*header).size, (*header).flags & IN_USE != 0) };
            if in_use {
                if write != read {
                    // SAFETY: both ranges lie inside the frame; `ptr::copy`
                    // handles the overlap.
                    unsafe {
                        ptr::copy(slot::ptr_at(read), slot::ptr_at(write), span);
                        let record = (*slot::header_at(write)).record;
                        if let Some(record) = record.as_ref() {
                            record.rebase(read - write, MoveDirection::Down);
                            stats.rebased += 1;
                        }
                    }
                    stats.moved += 1;
                }
                write += span;
            }
            read += span;
        }

        stats.reclaimed = self.top - write;
        if stats.reclaimed > 0 {
            // SAFETY: `[write, top)` is inside the frame and now unused.
            unsafe { ptr::write_bytes(slot::ptr_at(write), 0, stats.reclaimed) };
        }
        self.top = write;
        stats
    }

    /// Tears down every slot and resets the frame to empty.
    ///
    /// Records are invalidated and payloads always dropped; a non-collectable
    /// payload that was already finalized is not finalized again. Returns the
    /// number of slots destroyed.
    ///
    /// # Safety
    ///
    /// No references into the frame may be live.
    pub(crate) unsafe fn clear(&mut self) -> usize {
        let mut destroyed = 0;
        for header in self.slots() {
            // SAFETY: headers yielded by the cursor belong to this frame.
            if unsafe { (*header).flags & IN_USE != 0 } {
                // SAFETY: as above; nested teardown only frees slots.
                unsafe { slot::destroy(header, Teardown::Reclaim) };
                destroyed += 1;
            }
        }
        let used = self.used();
        if used > 0 {
            // SAFETY: `[base, top)` belongs to this frame.
            unsafe { ptr::write_bytes(slot::ptr_at(self.base), 0, used) };
        }
        self.top = self.base;
        destroyed
    }

    /// Zeroes the free tail.
    ///
    /// # Safety
    ///
    /// `[top, end)` must be owned by this frame.
    pub(crate) unsafe fn blank(&mut self) {
        if !self.blanked && self.available() > 0 {
            // SAFETY: guaranteed by the caller.
            unsafe { ptr::write_bytes(slot::ptr_at(self.top), 0, self.available()) };
        }
        self.blanked = true;
    }

    /// Count of `(in_use, finalized_but_kept, free)` slots.
    pub(crate) fn census(&self) -> (usize, usize, usize) {
        let mut census = (0, 0, 0);
        for header in self.slots() {
            // SAFETY: headers yielded by the cursor belong to this frame.
            let flags = unsafe { (*header).flags };
            if flags & IN_USE == 0 {
                census.2 += 1;
            } else if flags & FINALIZED != 0 {
                census.1 += 1;
            } else {
                census.0 += 1;
            }
        }
        census
    }
}

impl Locator for Region {
    fn base_address(&self) -> usize {
        self.base
    }

    fn is_valid(&self) -> bool {
        self.live
    }

    fn register_move_all(&mut self, delta: usize, direction: MoveDirection) -> usize {
        self.base = direction.apply(self.base, delta);
        self.end = direction.apply(self.end, delta);
        self.top = direction.apply(self.top, delta);

        let mut rebased = 0;
        for header in self.slots() {
            // SAFETY: the bytes were already moved, so the cursor walks the
            // frame at its new address.
            if let Some(record) = unsafe { (*header).record.as_ref() } {
                record.rebase(delta, direction);
                rebased += 1;
            }
        }
        rebased
    }
}
