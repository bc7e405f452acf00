//! Tracking records.
//!
//! A [`TrackingRecord`] is the stable indirection every handle points at.
//! Records are heap allocated on their own and never move; only the address
//! they hold changes when the arena relocates the target. The record keeps a
//! reference count of the handles that share it and is freed when the last
//! one goes away.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::{ArenaError, Result};
use crate::locator::MoveDirection;
use crate::registry::SlotVTable;
use crate::slot::{self, Teardown, HEADER_SIZE};

/// The target is alive and may be resolved.
const VALID: u8 = 1;
/// Teardown of the target is in progress.
const DYING: u8 = 1 << 1;
/// The target lives in an arena slot rather than in its own allocation.
const MEMORY_MANAGED: u8 = 1 << 2;
/// The shared null record. Never counted, never freed.
const STATIC: u8 = 1 << 3;

/// Shared, address-independent reference to a single object.
///
/// Handles never hold the object's address directly; they hold a record,
/// and the arena rewrites the record's address whenever the object moves.
pub struct TrackingRecord {
    ref_count: AtomicUsize,
    flags: AtomicU8,
    address: AtomicUsize,
    arena_id: u64,
    vtable: *const SlotVTable,
}

// SAFETY: the only non-`Sync` field is a pointer to a leaked, immutable
// vtable. Every mutable field is atomic.
unsafe impl Sync for TrackingRecord {}

/// Target of every null handle.
pub(crate) static NULL_RECORD: TrackingRecord = TrackingRecord {
    ref_count: AtomicUsize::new(0),
    flags: AtomicU8::new(STATIC),
    address: AtomicUsize::new(0),
    arena_id: 0,
    vtable: std::ptr::null(),
};

/// Live records per arena id.
#[cfg(any(test, feature = "test-util"))]
type LiveCounts = parking_lot::Mutex<std::collections::HashMap<u64, usize>>;

#[cfg(any(test, feature = "test-util"))]
static LIVE_RECORDS: std::sync::LazyLock<LiveCounts> = std::sync::LazyLock::new(Default::default);

/// Number of records created for arena `arena_id` and not yet freed.
#[cfg(any(test, feature = "test-util"))]
pub(crate) fn live_records(arena_id: u64) -> usize {
    LIVE_RECORDS.lock().get(&arena_id).copied().unwrap_or(0)
}

#[cfg(any(test, feature = "test-util"))]
fn count_live(arena_id: u64, freed: bool) {
    let mut live = LIVE_RECORDS.lock();
    let count = live.entry(arena_id).or_default();
    if freed {
        *count -= 1;
    } else {
        *count += 1;
    }
}

impl TrackingRecord {
    fn allocate(address: usize, arena_id: u64, vtable: *const SlotVTable, flags: u8) -> NonNull<Self> {
        #[cfg(any(test, feature = "test-util"))]
        count_live(arena_id, false);

        let record = Box::new(Self {
            ref_count: AtomicUsize::new(0),
            flags: AtomicU8::new(flags),
            address: AtomicUsize::new(address),
            arena_id,
            vtable,
        });
        NonNull::from(Box::leak(record))
    }

    /// Record for a payload living in an arena slot at `address`.
    pub(crate) fn new_in_arena(
        address: usize,
        arena_id: u64,
        vtable: Option<&'static SlotVTable>,
    ) -> NonNull<Self> {
        let vtable = vtable.map_or(std::ptr::null(), std::ptr::from_ref);
        Self::allocate(address, arena_id, vtable, VALID | MEMORY_MANAGED)
    }

    /// Record for a value in its own `Box` allocation.
    pub(crate) fn new_detached(
        address: usize,
        arena_id: u64,
        vtable: &'static SlotVTable,
    ) -> NonNull<Self> {
        Self::allocate(address, arena_id, vtable, VALID)
    }

    pub(crate) fn null() -> NonNull<Self> {
        NonNull::from(&NULL_RECORD)
    }

    pub(crate) fn is_null_record(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & STATIC != 0
    }

    /// Number of handles sharing this record.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the target is alive. The null record is never valid.
    pub fn is_valid(&self) -> bool {
        self.flags.load(Ordering::Acquire) & (VALID | DYING) == VALID
    }

    /// Whether the target lives in an arena slot.
    pub fn is_memory_managed(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & MEMORY_MANAGED != 0
    }

    /// Id of the arena the record was created by.
    pub const fn arena_id(&self) -> u64 {
        self.arena_id
    }

    /// Current target address, 0 once the target is gone.
    pub fn address(&self) -> usize {
        self.address.load(Ordering::Acquire)
    }

    pub(crate) fn vtable(&self) -> Option<&'static SlotVTable> {
        // SAFETY: vtables are leaked by the registrar and never freed.
        unsafe { self.vtable.as_ref() }
    }

    pub(crate) fn resolve(&self) -> Result<usize> {
        if !self.is_valid() {
            return Err(ArenaError::DanglingReference);
        }
        Ok(self.address.load(Ordering::Acquire))
    }

    pub(crate) fn increment_refs(&self) {
        if !self.is_null_record() {
            self.ref_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Takes a reference only while at least one is still held.
    ///
    /// A record whose count already reached zero is waiting to be
    /// reclaimed and must not gain new handles.
    pub(crate) fn try_increment_refs(&self) -> bool {
        self.is_null_record()
            || self
                .ref_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n > 0).then_some(n + 1))
                .is_ok()
    }

    /// Returns the remaining count. The null record always reports 1.
    pub(crate) fn decrement_refs(&self) -> usize {
        if self.is_null_record() {
            return 1;
        }
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Shifts the stored address by `delta` bytes.
    pub(crate) fn rebase(&self, delta: usize, direction: MoveDirection) {
        match direction {
            MoveDirection::Up => self.address.fetch_add(delta, Ordering::AcqRel),
            MoveDirection::Down => self.address.fetch_sub(delta, Ordering::AcqRel),
        };
    }

    /// Points the record at a new absolute address.
    pub(crate) fn relocate(&self, address: usize) -> usize {
        self.address.swap(address, Ordering::AcqRel)
    }

    /// Marks the target gone. Returns whether it was valid before.
    pub(crate) fn invalidate(&self) -> bool {
        if self.is_null_record() {
            return false;
        }
        let prev = self.flags.fetch_and(!(VALID | DYING), Ordering::AcqRel);
        self.address.store(0, Ordering::Release);
        prev & VALID != 0
    }

    /// Claims the right to tear the target down.
    ///
    /// Fails if the target is already gone or another teardown is running.
    fn begin_teardown(&self) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & (VALID | DYING | STATIC) == VALID).then_some(flags | DYING)
            })
            .is_ok()
    }

    /// Runs the target's finalize and delete sequence.
    ///
    /// # Safety
    ///
    /// The caller must hold the teardown claim, and no references into the
    /// target may be live.
    unsafe fn finalize_target(&self) {
        let address = self.address.load(Ordering::Acquire);
        if self.is_memory_managed() {
            // SAFETY: a valid in-arena record always points at a live payload
            // whose header sits right in front of it.
            unsafe { slot::destroy(slot::header_at(address - HEADER_SIZE), Teardown::Release) };
        } else if let Some(vtable) = self.vtable() {
            let ptr = slot::ptr_at(address);
            // SAFETY: detached targets are `Box` allocations of the vtable's type.
            unsafe {
                let collectable = match vtable.managed {
                    Some(managed) => {
                        (managed.finalize)(ptr);
                        (managed.is_collectable)(ptr)
                    }
                    None => true,
                };
                if collectable {
                    (vtable.drop_boxed_fn)(ptr);
                }
            }
        }
        self.invalidate();
    }

    /// Forced teardown through a handle.
    ///
    /// Returns `false` if the target was already destroyed or is being
    /// destroyed right now.
    ///
    /// # Safety
    ///
    /// No references into the target may be live.
    pub(crate) unsafe fn destroy_target(&self) -> bool {
        if !self.begin_teardown() {
            return false;
        }
        // SAFETY: claim acquired above, borrows ruled out by the caller.
        unsafe { self.finalize_target() };
        true
    }

    /// Drops one reference and frees the record when it was the last.
    ///
    /// Releasing the last reference to a valid target destroys the target
    /// first.
    ///
    /// # Safety
    ///
    /// `this` must come from [`new_in_arena`](Self::new_in_arena),
    /// [`new_detached`](Self::new_detached) or [`null`](Self::null), and the
    /// caller must own one of its references.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        // SAFETY: the caller owns a reference, so the record is alive.
        if unsafe { this.as_ref() }.decrement_refs() != 0 {
            return;
        }
        // SAFETY: that was the last reference.
        unsafe { Self::reclaim(this) };
    }

    /// Tears down a still-valid target and frees the record.
    ///
    /// # Safety
    ///
    /// The reference count of `this` must have reached zero, no other code
    /// may reclaim it, and no references into the target may be live.
    pub(crate) unsafe fn reclaim(this: NonNull<Self>) {
        // SAFETY: unreferenced records stay allocated until this call.
        let record = unsafe { this.as_ref() };
        if record.begin_teardown() {
            // SAFETY: the last handle is gone, nothing can borrow the target.
            unsafe { record.finalize_target() };
        }

        #[cfg(any(test, feature = "test-util"))]
        count_live(record.arena_id, true);

        // SAFETY: allocated by `allocate` and no other reference remains.
        drop(unsafe { Box::from_raw(this.as_ptr()) });
    }
}

impl fmt::Debug for TrackingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingRecord")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("ref_count", &self.ref_count())
            .field("valid", &self.is_valid())
            .field("memory_managed", &self.is_memory_managed())
            .field("arena_id", &self.arena_id)
            .finish()
    }
}
