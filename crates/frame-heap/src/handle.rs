//! Handles: relocation-safe, reference-counted references.
//!
//! A [`Handle<T>`] points at a [`TrackingRecord`], never at the object. The
//! arena rewrites the record when it moves the object, so a handle stays
//! usable across grows, defragments and frame shifts. Dereferencing goes
//! through the owning [`Arena`]: a shared borrow for [`Handle::get`], an
//! exclusive one for [`Handle::get_mut`]. Structural operations need
//! `&mut Arena`, so no reference obtained from a handle can outlive a move.
//!
//! [`AnyHandle`] is the type-erased form. It plays the part of a base-class
//! reference: any `Handle<T>` converts into it, and it converts back with a
//! checked [`downcast`](AnyHandle::downcast).

use std::any::type_name;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::error::{ArenaError, Result};
use crate::record::TrackingRecord;
use crate::shared::SharedHandle;

// ============================================================================
// RawHandle - one counted reference to a record
// ============================================================================

pub(crate) struct RawHandle {
    record: NonNull<TrackingRecord>,
}

impl RawHandle {
    pub(crate) fn null() -> Self {
        Self {
            record: TrackingRecord::null(),
        }
    }

    /// Takes a new reference to `record`.
    pub(crate) fn from_record(record: NonNull<TrackingRecord>) -> Self {
        // SAFETY: callers pass a live record (fresh, static, or shared by
        // another handle that is still alive).
        unsafe { record.as_ref() }.increment_refs();
        Self { record }
    }

    /// Wraps a reference the caller already took.
    pub(crate) const fn adopt(record: NonNull<TrackingRecord>) -> Self {
        Self { record }
    }

    pub(crate) const fn record_ptr(&self) -> NonNull<TrackingRecord> {
        self.record
    }

    pub(crate) fn record(&self) -> &TrackingRecord {
        // SAFETY: this handle owns a reference, keeping the record alive.
        unsafe { self.record.as_ref() }
    }

    fn is_null(&self) -> bool {
        self.record().is_null_record()
    }

    /// Checks ownership and validity, returning the target address.
    fn locate(&self, arena: &Arena) -> Result<usize> {
        arena.check_owner(self.record())?;
        self.record().resolve()
    }

    fn destroy(&self, arena: &mut Arena) -> Result<bool> {
        if self.is_null() {
            return Ok(false);
        }
        arena.check_owner(self.record())?;
        // SAFETY: `&mut Arena` rules out live references into the target.
        let destroyed = unsafe { self.record().destroy_target() };
        if destroyed {
            arena.metrics.slots_destroyed += 1;
        }
        Ok(destroyed)
    }

    fn type_name(&self) -> Option<&'static str> {
        self.record().vtable().map(crate::registry::SlotVTable::type_name)
    }

    fn is<T: 'static>(&self) -> bool {
        self.record().vtable().is_some_and(crate::registry::SlotVTable::is::<T>)
    }
}

impl Clone for RawHandle {
    fn clone(&self) -> Self {
        Self::from_record(self.record)
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        // SAFETY: this handle owns exactly one reference.
        unsafe { TrackingRecord::release(self.record) };
    }
}

// ============================================================================
// Handle<T>
// ============================================================================

/// Counted reference to a `T` owned by an [`Arena`].
///
/// Cloning shares the record; the target is destroyed when the last clone is
/// dropped, or earlier through [`destroy`](Self::destroy). A destroyed
/// target leaves every remaining handle dangling, and dereferencing a
/// dangling handle returns [`ArenaError::DanglingReference`].
///
/// Handles are neither `Send` nor `Sync`; [`share`](Self::share) one to
/// hand it to another thread.
pub struct Handle<T: 'static> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Handle<T> {
    pub(crate) const fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// A handle to nothing. It shares one static record, is never valid and
    /// is never counted.
    #[must_use]
    pub fn null() -> Self {
        Self::from_raw(RawHandle::null())
    }

    /// Returns `true` for handles created by [`null`](Self::null).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// Whether the target is still alive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.raw.record().is_valid()
    }

    /// Whether the target lives in an arena slot rather than its own
    /// allocation.
    #[must_use]
    pub fn is_memory_managed(&self) -> bool {
        self.raw.record().is_memory_managed()
    }

    /// Number of handles sharing this target, 0 for a null handle.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.raw.record().ref_count()
    }

    /// Returns `true` if both handles share a record.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.raw.record == other.raw.record
    }

    /// The record backing this handle.
    #[must_use]
    pub fn record(&self) -> &TrackingRecord {
        self.raw.record()
    }

    /// Borrows the target.
    ///
    /// # Errors
    ///
    /// [`ArenaError::DanglingReference`] if the target is gone or the handle
    /// is null, [`ArenaError::ForeignArena`] if `arena` does not own it.
    pub fn get<'a>(&'a self, arena: &'a Arena) -> Result<&'a T> {
        let addr = self.raw.locate(arena)?;
        // SAFETY: the record is valid, so `addr` holds a live `T`. Nothing
        // can move or free it while `arena` is borrowed and this handle
        // keeps the reference count above zero.
        Ok(unsafe { &*ptr::with_exposed_provenance::<T>(addr) })
    }

    /// Mutably borrows the target.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_mut<'a>(&'a self, arena: &'a mut Arena) -> Result<&'a mut T> {
        let addr = self.raw.locate(arena)?;
        // SAFETY: as in `get`; the exclusive arena borrow rules out any other
        // reference into the arena, including through other handles.
        Ok(unsafe { &mut *ptr::with_exposed_provenance_mut::<T>(addr) })
    }

    /// Current address of the target.
    ///
    /// The pointer is only good until the next structural operation on the
    /// owning arena.
    ///
    /// # Errors
    ///
    /// [`ArenaError::DanglingReference`] if the target is gone.
    pub fn resolve(&self) -> Result<NonNull<T>> {
        let addr = self.raw.record().resolve()?;
        NonNull::new(ptr::with_exposed_provenance_mut::<T>(addr)).ok_or(ArenaError::DanglingReference)
    }

    /// Finalizes and deletes the target now.
    ///
    /// Every handle sharing the record becomes dangling. This handle, like
    /// the others, keeps its reference to the record until it is dropped, so
    /// [`ref_count`](Self::ref_count) does not change. Returns `Ok(false)`
    /// if the target was already destroyed, so calling it twice is safe.
    /// A [`Managed`](crate::Managed) target that is not collectable is
    /// finalized but keeps its storage until its frame is cleared.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ForeignArena`] if `arena` does not own the target.
    pub fn destroy(&self, arena: &mut Arena) -> Result<bool> {
        self.raw.destroy(arena)
    }

    /// Name of the target's type as registered, `None` for null handles.
    #[must_use]
    pub fn type_name(&self) -> Option<&'static str> {
        self.raw.type_name()
    }

    /// Thread-safe handle sharing this handle's record.
    ///
    /// # Errors
    ///
    /// [`ArenaError::DanglingReference`] for null handles,
    /// [`ArenaError::ForeignArena`] if `arena` does not own the target.
    pub fn share(&self, arena: &Arena) -> Result<SharedHandle<T>>
    where
        T: Send,
    {
        arena.check_owner(self.raw.record())?;
        Ok(SharedHandle::new(&self.raw, arena.release_queue()))
    }

    /// Converts into a type-erased handle sharing the same record.
    #[must_use]
    pub fn erase(self) -> AnyHandle {
        AnyHandle { raw: self.raw }
    }

    /// Type-erased clone of this handle.
    #[must_use]
    pub fn to_any(&self) -> AnyHandle {
        AnyHandle {
            raw: self.raw.clone(),
        }
    }

    /// Checked cast to another target type.
    ///
    /// A null handle casts to a null handle of any type. Otherwise the cast
    /// succeeds only if the target really is a `U`, and the result shares
    /// this handle's record.
    #[must_use]
    pub fn dynamic_cast<U: 'static>(&self) -> Option<Handle<U>> {
        if self.is_null() {
            return Some(Handle::null());
        }
        self.raw.is::<U>().then(|| Handle::from_raw(self.raw.clone()))
    }

    /// Repoints this handle at `source` if its target is a `T`.
    ///
    /// Returns `false` and leaves this handle untouched on a type mismatch.
    /// A null `source` always assigns.
    pub fn cast_assign(&mut self, source: &AnyHandle) -> bool {
        if !source.raw.is_null() && !source.raw.is::<T>() {
            return false;
        }
        self.raw = source.raw.clone();
        true
    }
}

impl<T: 'static> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T: 'static> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: 'static> From<Handle<T>> for AnyHandle {
    fn from(handle: Handle<T>) -> Self {
        handle.erase()
    }
}

impl<T: 'static> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: 'static> Eq for Handle<T> {}

impl<T: 'static> PartialEq<AnyHandle> for Handle<T> {
    fn eq(&self, other: &AnyHandle) -> bool {
        self.raw.record == other.raw.record
    }
}

impl<T: 'static> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: 'static> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.record.cmp(&other.raw.record)
    }
}

impl<T: 'static> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.record.hash(state);
    }
}

impl<T: 'static> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Handle<{}>(null)", type_name::<T>());
        }
        f.debug_struct("Handle")
            .field("type", &type_name::<T>())
            .field("record", &self.raw.record())
            .finish()
    }
}

// ============================================================================
// AnyHandle
// ============================================================================

/// Type-erased [`Handle`].
pub struct AnyHandle {
    raw: RawHandle,
}

impl AnyHandle {
    /// A null handle.
    #[must_use]
    pub fn null() -> Self {
        Self {
            raw: RawHandle::null(),
        }
    }

    /// Returns `true` for null handles.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// Whether the target is still alive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.raw.record().is_valid()
    }

    /// Whether the target is a `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.raw.is::<T>()
    }

    /// Name of the target's type, `None` for null handles.
    #[must_use]
    pub fn type_name(&self) -> Option<&'static str> {
        self.raw.type_name()
    }

    /// Number of handles sharing this target.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.raw.record().ref_count()
    }

    /// Returns `true` if both handles share a record.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.raw.record == other.raw.record
    }

    /// Converts back into a typed handle. A null handle downcasts to any
    /// type.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if the target is not a `T`.
    pub fn downcast<T: 'static>(self) -> std::result::Result<Handle<T>, Self> {
        if self.is_null() || self.is::<T>() {
            Ok(Handle::from_raw(self.raw))
        } else {
            Err(self)
        }
    }

    /// Typed clone of this handle.
    ///
    /// # Errors
    ///
    /// [`ArenaError::InvalidCast`] if the target is not a `T`.
    pub fn try_cast<T: 'static>(&self) -> Result<Handle<T>> {
        if self.is_null() || self.is::<T>() {
            return Ok(Handle::from_raw(self.raw.clone()));
        }
        Err(ArenaError::InvalidCast {
            from: self.type_name().unwrap_or("<untyped>"),
            to: type_name::<T>(),
        })
    }

    /// Same as [`Handle::destroy`].
    ///
    /// # Errors
    ///
    /// [`ArenaError::ForeignArena`] if `arena` does not own the target.
    pub fn destroy(&self, arena: &mut Arena) -> Result<bool> {
        self.raw.destroy(arena)
    }
}

impl Clone for AnyHandle {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
        }
    }
}

impl Default for AnyHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for AnyHandle {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for AnyHandle {}

impl<T: 'static> PartialEq<Handle<T>> for AnyHandle {
    fn eq(&self, other: &Handle<T>) -> bool {
        self.raw.record == other.raw.record
    }
}

impl PartialOrd for AnyHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnyHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.record.cmp(&other.raw.record)
    }
}

impl Hash for AnyHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.record.hash(state);
    }
}

impl fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("AnyHandle(null)");
        }
        f.debug_struct("AnyHandle")
            .field("type", &self.type_name())
            .field("record", &self.raw.record())
            .finish()
    }
}
