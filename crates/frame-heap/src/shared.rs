//! Handles that cross threads.
//!
//! A [`SharedHandle<T>`] is the `Send + Sync` form of a [`Handle<T>`]. Any
//! thread may clone or drop it, check whether the target is alive, read the
//! reference count or resolve the target's current address. Dereferencing
//! still goes through the owning [`Arena`], which never leaves its thread:
//! [`SharedHandle::to_local`] turns the handle back into a [`Handle`] there.
//!
//! Tearing a target down runs user code and writes arena memory, so it never
//! happens on a foreign thread. When the last reference to a record goes away
//! through a shared handle, the record is queued on its arena instead. The
//! arena reclaims queued records at the start of its next allocation or
//! structural operation, or when [`Arena::drain_releases`] is called.

use std::any::type_name;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::arena::Arena;
use crate::error::{ArenaError, Result};
use crate::handle::{Handle, RawHandle};
use crate::record::TrackingRecord;

// ============================================================================
// ReleaseQueue
// ============================================================================

/// A record whose reference count reached zero off the arena's thread.
struct PendingRelease(NonNull<TrackingRecord>);

// SAFETY: a queued record has no handles left. The only code that touches
// it afterwards is the single drain that pops it.
unsafe impl Send for PendingRelease {}

/// Records waiting for their arena to reclaim them.
pub(crate) struct ReleaseQueue {
    pending: SegQueue<PendingRelease>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: SegQueue::new(),
        })
    }

    fn push(&self, record: NonNull<TrackingRecord>) {
        self.pending.push(PendingRelease(record));
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Reclaims every queued record. Returns how many there were.
    ///
    /// # Safety
    ///
    /// Must run on the owning arena's thread with no references into the
    /// arena live, or after the arena has been dropped.
    pub(crate) unsafe fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(PendingRelease(record)) = self.pending.pop() {
            // SAFETY: queued records reached zero references and are popped
            // exactly once; the caller rules out borrows of their targets.
            unsafe { TrackingRecord::reclaim(record) };
            drained += 1;
        }
        drained
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        // The arena is gone, and its teardown invalidated every in-arena
        // target. Only detached targets of `Send` types are left to drop.
        // SAFETY: nothing can borrow into a dropped arena.
        unsafe { self.drain() };
    }
}

// ============================================================================
// SharedHandle<T>
// ============================================================================

/// Counted, thread-safe reference to a `T` owned by an [`Arena`].
///
/// Created with [`Handle::share`]. It shares the record, and therefore the
/// reference count, of the handle it came from.
///
/// ```
/// use frame_heap::Arena;
///
/// let mut arena = Arena::new();
/// let frame = arena.add_frame();
/// let local = arena.alloc(frame, 42u64).unwrap();
/// let shared = local.share(&arena).unwrap();
///
/// let count = std::thread::scope(|s| {
///     s.spawn(|| shared.clone().ref_count()).join().unwrap()
/// });
/// assert_eq!(count, 3);
///
/// let back = shared.to_local(&arena).unwrap();
/// assert_eq!(*back.get(&arena).unwrap(), 42);
/// ```
pub struct SharedHandle<T: 'static> {
    record: NonNull<TrackingRecord>,
    releases: Arc<ReleaseQueue>,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: every operation that works without the arena only touches the
// record's atomics. A target released last through a shared handle is torn
// down by its arena's thread, except a detached target outliving its arena,
// which is dropped wherever the queue goes away; hence `T: Send`.
unsafe impl<T: Send + 'static> Send for SharedHandle<T> {}

// SAFETY: see `Send`; `&SharedHandle` only allows clones and atomic reads.
unsafe impl<T: Send + 'static> Sync for SharedHandle<T> {}

impl<T: 'static> SharedHandle<T> {
    /// Takes a new reference to `raw`'s record.
    pub(crate) fn new(raw: &RawHandle, releases: Arc<ReleaseQueue>) -> Self {
        raw.record().increment_refs();
        Self {
            record: raw.record_ptr(),
            releases,
            _marker: PhantomData,
        }
    }

    fn record(&self) -> &TrackingRecord {
        // SAFETY: this handle owns a reference, keeping the record alive.
        unsafe { self.record.as_ref() }
    }

    /// Whether the target is still alive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.record().is_valid()
    }

    /// Whether the target lives in an arena slot.
    #[must_use]
    pub fn is_memory_managed(&self) -> bool {
        self.record().is_memory_managed()
    }

    /// Number of handles, local and shared, referencing the target.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.record().ref_count()
    }

    /// Id of the arena that owns the target.
    #[must_use]
    pub fn arena_id(&self) -> u64 {
        self.record().arena_id()
    }

    /// Current address of the target.
    ///
    /// The address changes whenever the owning arena moves the target, so
    /// another thread can only observe it, never dereference it.
    ///
    /// # Errors
    ///
    /// [`ArenaError::DanglingReference`] if the target is gone.
    pub fn resolve(&self) -> Result<NonNull<T>> {
        let addr = self.record().resolve()?;
        NonNull::new(ptr::with_exposed_provenance_mut::<T>(addr)).ok_or(ArenaError::DanglingReference)
    }

    /// Returns `true` if both handles share a record.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.record == other.record
    }

    /// Converts back into a [`Handle`] on the arena's own thread.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ForeignArena`] if `arena` does not own the target.
    pub fn to_local(&self, arena: &Arena) -> Result<Handle<T>> {
        arena.check_owner(self.record())?;
        Ok(Handle::from_raw(RawHandle::from_record(self.record)))
    }
}

impl<T: 'static> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        self.record().increment_refs();
        Self {
            record: self.record,
            releases: Arc::clone(&self.releases),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        if self.record().decrement_refs() == 0 {
            self.releases.push(self.record);
        }
    }
}

impl<T: 'static> PartialEq for SharedHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: 'static> Eq for SharedHandle<T> {}

impl<T: 'static> PartialEq<Handle<T>> for SharedHandle<T> {
    fn eq(&self, other: &Handle<T>) -> bool {
        ptr::eq(self.record(), other.record())
    }
}

impl<T: 'static> PartialOrd for SharedHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: 'static> Ord for SharedHandle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record.cmp(&other.record)
    }
}

impl<T: 'static> Hash for SharedHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.record.hash(state);
    }
}

impl<T: 'static> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("type", &type_name::<T>())
            .field("record", self.record())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_shared_handle_is_send_and_sync() {
        assert_send_sync::<SharedHandle<u64>>();
        assert_send_sync::<SharedHandle<String>>();
    }

    #[test]
    fn test_last_release_is_queued() {
        let mut arena = Arena::new();
        let frame = arena.add_frame();
        let shared = arena.alloc(frame, 1u32).unwrap().share(&arena).unwrap();
        assert_eq!(shared.ref_count(), 1);

        drop(shared);
        assert_eq!(arena.pending_releases(), 1);
        assert_eq!(arena.drain_releases(), 1);
        assert_eq!(arena.pending_releases(), 0);
        assert_eq!(arena.frame_info(frame).unwrap().free_slots, 1);
    }
}
