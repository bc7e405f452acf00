//! The arena: one relocatable buffer split into stacked frames.
//!
//! # Layout
//!
//! ```text
//! base                                                       top       end
//! |-- frame 0 ------------|-- frame 1 -------|-- frame 2 ----|-- free --|
//! | slot | slot | ..free..| slot | ..free..  | slot | slot   |          |
//! ```
//!
//! Frames tile `[base, top)` in push order with no gaps. Only the topmost
//! frame borders the arena's free tail. A frame that runs out of room takes
//! the tail by sliding every frame above it up to `end`; if the tail is too
//! small the arena grows first, which may move the whole buffer.
//!
//! Every move is reported through [`Locator`] so that tracking records keep
//! pointing at their objects.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::backing::Backing;
use crate::config::ArenaConfig;
use crate::error::{ArenaError, Result};
use crate::handle::{Handle, RawHandle};
use crate::locator::{Locator, MoveDirection};
use crate::managed::Managed;
use crate::metrics::{global_metrics, ArenaMetrics, PackStats};
use crate::record::TrackingRecord;
use crate::region::Region;
use crate::registry::{SlotType, SlotVTable};
use crate::shared::ReleaseQueue;
use crate::slot::{self, round_up, SlotHeader, FINALIZED, HEADER_SIZE, IN_USE, SLOT_ALIGN};
use crate::tracing::internal::{
    log_capacity, log_compaction, log_frame_added, log_relocation, trace_op,
};
use crate::tracing::ArenaOp;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one frame of one arena.
///
/// Ids are never reused, so an id kept after its frame was removed is
/// rejected with [`ArenaError::UnknownFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    arena: u64,
    serial: u64,
}

impl FrameId {
    /// Id of the arena the frame belongs to.
    #[must_use]
    pub const fn arena_id(self) -> u64 {
        self.arena
    }

    /// Push order of the frame within its arena.
    #[must_use]
    pub const fn serial(self) -> u64 {
        self.serial
    }
}

/// Snapshot of one frame's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// The frame.
    pub id: FrameId,
    /// First byte owned by the frame.
    pub base: usize,
    /// One past the last byte owned by the frame.
    pub end: usize,
    /// One past the last allocated slot.
    pub top: usize,
    /// Free bytes a trim keeps.
    pub trim_reserve: usize,
    /// Whether the frame borders the arena's free tail.
    pub topmost: bool,
    /// Slots holding a live payload.
    pub live_slots: usize,
    /// Finalized, non-collectable payloads still holding storage.
    pub kept_slots: usize,
    /// Destroyed slots waiting for a defragment.
    pub free_slots: usize,
}

impl FrameInfo {
    /// Bytes between `base` and `top`, holes included.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.top - self.base
    }

    /// Bytes between `top` and `end`.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.end - self.top
    }

    /// Total bytes owned.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.base
    }

    /// Whether the frame owns no bytes at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.base
    }
}

/// One slot as seen by [`Arena::slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Payload address.
    pub addr: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// Whether the slot holds a payload.
    pub in_use: bool,
    /// Whether the payload's finalizer has run.
    pub finalized: bool,
    /// Registered type, `None` for untyped slots.
    pub type_name: Option<&'static str>,
    /// Whether a tracking record points at the slot.
    pub tracked: bool,
}

/// A relocatable buffer of stacked frames.
///
/// Allocation is a bump in the target frame. Freed slots become holes until
/// [`defrag`](Self::defrag) or [`pack`](Self::pack). Objects are reached
/// through [`Handle`]s, which survive every move the arena makes; raw
/// pointers from [`malloc`](Self::malloc) do not.
///
/// All operations that move memory take `&mut self`. The arena is neither
/// `Send` nor `Sync`; [`SharedHandle`](crate::SharedHandle)s reach its
/// objects from other threads.
///
/// ```
/// use frame_heap::Arena;
///
/// let mut arena = Arena::with_capacity(1024);
/// let frame = arena.add_frame();
/// let name = arena.alloc(frame, String::from("alpha")).unwrap();
/// assert_eq!(name.get(&arena).unwrap(), "alpha");
///
/// arena.grow(4096).unwrap();
/// assert_eq!(name.get(&arena).unwrap(), "alpha");
/// ```
pub struct Arena {
    id: u64,
    backing: Backing,
    base: usize,
    end: usize,
    top: usize,
    frames: Vec<Region>,
    next_serial: u64,
    config: ArenaConfig,
    pub(crate) metrics: ArenaMetrics,
    releases: Arc<ReleaseQueue>,
    _not_send: PhantomData<*mut ()>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Arena with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(ArenaConfig::new().capacity())
    }

    /// Heap-backed arena with `bytes` of initial capacity.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds `isize::MAX`.
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        match Self::with_config(ArenaConfig::new().initial_capacity(bytes)) {
            Ok(arena) => arena,
            Err(err) => panic!("{err}"),
        }
    }

    /// Arena built from `config`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::Exhausted`] if the initial buffer cannot be allocated.
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        let capacity = config.capacity();
        let backing = Backing::allocate(config.backing, capacity)?;
        Ok(Self::from_backing(backing, capacity, config))
    }

    /// Arena living in a caller-provided buffer. It never moves and never
    /// grows past the buffer; a request that does not fit fails with
    /// [`ArenaError::Exhausted`].
    #[must_use]
    pub fn with_buffer(buffer: &'static mut [u8], config: ArenaConfig) -> Self {
        let len = buffer.len();
        let backing = Backing::external(NonNull::from(buffer).cast::<u8>(), len);
        let capacity = backing.limit();
        Self::from_backing(backing, capacity, config)
    }

    /// Arena living in caller memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// life of the arena, and nothing else may access that memory meanwhile.
    #[must_use]
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize, config: ArenaConfig) -> Self {
        let backing = Backing::external(ptr, len);
        let capacity = backing.limit();
        Self::from_backing(backing, capacity, config)
    }

    fn from_backing(backing: Backing, capacity: usize, config: ArenaConfig) -> Self {
        global_metrics().record_arena_created();
        let base = backing.base();
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            backing,
            base,
            end: base + capacity,
            top: base,
            frames: Vec::new(),
            next_serial: 0,
            config,
            metrics: ArenaMetrics::new(),
            releases: ReleaseQueue::new(),
            _not_send: PhantomData,
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Process-unique id of this arena.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The configuration the arena was built with.
    #[must_use]
    pub const fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Bytes between base and end.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.end - self.base
    }

    /// Bytes owned by frames.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.top - self.base
    }

    /// Bytes in the free tail.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.end - self.top
    }

    /// Current base address. Changes when the arena relocates.
    #[must_use]
    pub const fn base_address(&self) -> usize {
        self.base
    }

    /// One past the topmost frame.
    #[must_use]
    pub const fn top_address(&self) -> usize {
        self.top
    }

    /// Whether the arena can move to a bigger buffer.
    #[must_use]
    pub const fn is_relocatable(&self) -> bool {
        self.backing.is_relocatable()
    }

    /// Number of frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frames in push order.
    pub fn frames(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.frames.iter().map(|region| region.id)
    }

    /// The frame bordering the free tail.
    #[must_use]
    pub fn topmost_frame(&self) -> Option<FrameId> {
        self.frames.last().map(|region| region.id)
    }

    /// Operation counters.
    #[must_use]
    pub const fn metrics(&self) -> ArenaMetrics {
        self.metrics
    }

    /// Bounds and slot counts of `frame`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn frame_info(&self, frame: FrameId) -> Result<FrameInfo> {
        let index = self.index_of(frame)?;
        let region = &self.frames[index];
        let (live_slots, kept_slots, free_slots) = region.census();
        Ok(FrameInfo {
            id: region.id,
            base: region.base,
            end: region.end,
            top: region.top,
            trim_reserve: region.trim_reserve,
            topmost: index + 1 == self.frames.len(),
            live_slots,
            kept_slots,
            free_slots,
        })
    }

    /// Every slot of `frame`, in address order.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn slots(&self, frame: FrameId) -> Result<Vec<SlotInfo>> {
        let index = self.index_of(frame)?;
        let slots = self.frames[index]
            .slots()
            .map(|header| {
                // SAFETY: headers yielded by the cursor belong to the frame.
                let header = unsafe { &*header };
                SlotInfo {
                    addr: slot::payload_addr(ptr::from_ref(header).addr()),
                    size: header.size,
                    in_use: header.flags & IN_USE != 0,
                    finalized: header.flags & FINALIZED != 0,
                    // SAFETY: vtables are leaked by the registrar.
                    type_name: unsafe { header.vtable.as_ref() }.map(SlotVTable::type_name),
                    tracked: !header.record.is_null(),
                }
            })
            .collect();
        Ok(slots)
    }

    fn index_of(&self, frame: FrameId) -> Result<usize> {
        if frame.arena != self.id {
            return Err(ArenaError::UnknownFrame(frame));
        }
        self.frames
            .binary_search_by_key(&frame.serial, |region| region.id.serial)
            .map_err(|_| ArenaError::UnknownFrame(frame))
    }

    /// Finds the frame and header of the live slot whose payload is `addr`.
    fn locate(&self, addr: usize) -> Option<(usize, *mut SlotHeader)> {
        let header = addr.checked_sub(HEADER_SIZE)?;
        let index = self
            .frames
            .partition_point(|region| region.base <= header)
            .checked_sub(1)?;
        self.frames[index].find(addr).map(|h| (index, h))
    }

    pub(crate) fn check_owner(&self, record: &TrackingRecord) -> Result<()> {
        if record.is_null_record() {
            return Err(ArenaError::DanglingReference);
        }
        if record.arena_id() != self.id {
            return Err(ArenaError::ForeignArena);
        }
        Ok(())
    }

    pub(crate) fn release_queue(&self) -> Arc<ReleaseQueue> {
        Arc::clone(&self.releases)
    }

    /// Records dropped by [`SharedHandle`](crate::SharedHandle)s and not
    /// yet reclaimed.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    /// Tears down every target whose last reference was dropped through a
    /// [`SharedHandle`](crate::SharedHandle) and frees its record. Returns
    /// the number of records reclaimed.
    ///
    /// Allocation and the frame-level operations that destroy or compact
    /// slots drain the queue on their own.
    pub fn drain_releases(&mut self) -> usize {
        // SAFETY: `&mut self` on the owning thread rules out references
        // into any target.
        let drained = unsafe { self.releases.drain() };
        self.metrics.deferred_releases += drained;
        drained
    }

    const fn exhausted(&self, requested: usize) -> ArenaError {
        ArenaError::Exhausted {
            requested,
            capacity: self.capacity(),
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Pushes a new frame that takes the whole free tail.
    ///
    /// The previous topmost frame is trimmed first, so it keeps only its
    /// used bytes plus its trim reserve.
    pub fn add_frame(&mut self) -> FrameId {
        if let Some(last) = self.frames.len().checked_sub(1) {
            self.trim_at(last);
        }

        let id = FrameId {
            arena: self.id,
            serial: self.next_serial,
        };
        self.next_serial += 1;

        let mut region = Region::new(id, self.top, self.end, self.config.trim_reserve);
        self.top = self.end;
        if self.config.blank_frames {
            // SAFETY: the new frame owns `[top, end)`.
            unsafe { region.blank() };
        }

        log_frame_added(id.serial, region.base, region.len());
        self.metrics.frames_added += 1;
        self.frames.push(region);
        id
    }

    /// Removes `frame`, destroying everything in it.
    ///
    /// Removing the topmost frame hands its bytes back to the free tail.
    /// Removing an interior frame slides every frame above it down to close
    /// the gap, rebasing their records.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn remove_frame(&mut self, frame: FrameId) -> Result<()> {
        let index = self.index_of(frame)?;
        self.drain_releases();
        let _span = trace_op(ArenaOp::RemoveFrame, self.id);

        // SAFETY: `&mut self` rules out references into the frame.
        let destroyed = unsafe { self.frames[index].clear() };
        self.metrics.slots_destroyed += destroyed;

        let mut region = self.frames.remove(index);
        region.live = false;

        if index == self.frames.len() {
            self.top = region.base;
        } else {
            let delta = region.len();
            if delta > 0 {
                let from = self.frames[index].base;
                // SAFETY: `[from, top)` and the destination are inside the
                // buffer; `ptr::copy` handles the overlap.
                unsafe { ptr::copy(slot::ptr_at(from), slot::ptr_at(from - delta), self.top - from) };
                self.move_frames_from(index, delta, MoveDirection::Down);
                self.top -= delta;
            }
        }

        self.metrics.frames_removed += 1;
        Ok(())
    }

    /// Removes the topmost frame. Returns `false` if there is none.
    pub fn pop_frame(&mut self) -> bool {
        self.topmost_frame()
            .is_some_and(|frame| self.remove_frame(frame).is_ok())
    }

    /// Runs `f` with a fresh frame that is removed afterwards.
    pub fn scope<R>(&mut self, f: impl FnOnce(&mut Self, FrameId) -> R) -> R {
        let frame = self.add_frame();
        let result = f(self, frame);
        // `f` may already have removed it.
        let _ = self.remove_frame(frame);
        result
    }

    /// Destroys every slot in `frame` but keeps the frame and its bytes.
    /// Returns the number of slots destroyed.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn clear_frame(&mut self, frame: FrameId) -> Result<usize> {
        let index = self.index_of(frame)?;
        self.drain_releases();
        // SAFETY: `&mut self` rules out references into the frame.
        let destroyed = unsafe { self.frames[index].clear() };
        self.metrics.slots_destroyed += destroyed;
        Ok(destroyed)
    }

    /// Zeroes the free space of `frame`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn blank_frame(&mut self, frame: FrameId) -> Result<()> {
        let index = self.index_of(frame)?;
        // SAFETY: the frame owns `[top, end)`.
        unsafe { self.frames[index].blank() };
        Ok(())
    }

    /// Sets how many free bytes a trim of `frame` keeps.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn set_trim_reserve(&mut self, frame: FrameId, bytes: usize) -> Result<()> {
        let index = self.index_of(frame)?;
        self.frames[index].trim_reserve = bytes;
        Ok(())
    }

    /// Applies a move to every frame from `index` upwards.
    fn move_frames_from(&mut self, index: usize, delta: usize, direction: MoveDirection) {
        let rebased: usize = self.frames[index..]
            .iter_mut()
            .map(|region| region.register_move_all(delta, direction))
            .sum();
        self.metrics.records_rebased += rebased;
    }

    /// Gives the whole free tail to the frame at `index`, sliding the frames
    /// above it up to the arena end. Returns the bytes gained.
    fn shift_above_at(&mut self, index: usize) -> usize {
        let gap = self.end - self.top;
        if gap == 0 {
            return 0;
        }

        let above = index + 1;
        if above < self.frames.len() {
            let from = self.frames[above].base;
            // SAFETY: `[from, top)` moves to `[from + gap, end)`, both inside
            // the buffer.
            unsafe { ptr::copy(slot::ptr_at(from), slot::ptr_at(from + gap), self.top - from) };
            self.move_frames_from(above, gap, MoveDirection::Up);
            self.metrics.shifts += 1;
        }

        let region = &mut self.frames[index];
        region.end += gap;
        region.blanked = false;
        self.top = self.end;
        gap
    }

    /// Slides every frame above `frame` flush against the arena end and
    /// hands the freed space to `frame`. Returns the bytes gained.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn shift_above(&mut self, frame: FrameId) -> Result<usize> {
        let index = self.index_of(frame)?;
        let _span = trace_op(ArenaOp::Shift, self.id);
        Ok(self.shift_above_at(index))
    }

    /// Grows `frame` into all free space in the arena. The inverse of
    /// [`trim_frame`](Self::trim_frame).
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn expand_frame(&mut self, frame: FrameId) -> Result<bool> {
        let index = self.index_of(frame)?;
        let _span = trace_op(ArenaOp::Expand, self.id);
        let gained = self.shift_above_at(index);
        if gained > 0 {
            self.metrics.expands += 1;
        }
        Ok(gained > 0)
    }

    /// Shrinks the frame at `index` to its used bytes plus its trim reserve
    /// and slides the frames above it down. Returns the bytes released.
    fn trim_at(&mut self, index: usize) -> usize {
        let region = &self.frames[index];
        let reserve = round_up(region.trim_reserve).unwrap_or(usize::MAX);
        let keep_end = region.top.saturating_add(reserve).min(region.end);
        let delta = region.end - keep_end;
        if delta == 0 {
            return 0;
        }

        let above = index + 1;
        if above < self.frames.len() {
            let from = self.frames[above].base;
            // SAFETY: `[from, top)` moves down into bytes the trimmed frame
            // gave up; `ptr::copy` handles the overlap.
            unsafe { ptr::copy(slot::ptr_at(from), slot::ptr_at(from - delta), self.top - from) };
            self.move_frames_from(above, delta, MoveDirection::Down);
        }

        self.frames[index].end = keep_end;
        self.top -= delta;
        self.metrics.trims += 1;
        delta
    }

    /// Shrinks `frame` to its used bytes plus its trim reserve. Frames above
    /// it slide down; the released bytes join the arena's free tail.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn trim_frame(&mut self, frame: FrameId) -> Result<bool> {
        let index = self.index_of(frame)?;
        let _span = trace_op(ArenaOp::Trim, self.id);
        Ok(self.trim_at(index) > 0)
    }

    /// Compacts `frame`, sliding live slots down over destroyed ones.
    /// Returns the bytes reclaimed.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] if `frame` is not a frame of this arena.
    pub fn defrag(&mut self, frame: FrameId) -> Result<usize> {
        let index = self.index_of(frame)?;
        self.drain_releases();
        let _span = trace_op(ArenaOp::Defrag, self.id);
        Ok(self.defrag_at(index))
    }

    fn defrag_at(&mut self, index: usize) -> usize {
        // SAFETY: `&mut self` rules out references into the frame.
        let stats = unsafe { self.frames[index].defrag() };
        log_compaction(self.frames[index].id.serial, stats.moved, stats.reclaimed);
        self.metrics.defrags += 1;
        self.metrics.records_rebased += stats.rebased;
        stats.reclaimed
    }

    // ========================================================================
    // Capacity
    // ========================================================================

    /// Grows capacity by at least `min_extra` bytes, rounded per the grow
    /// policy. Returns the new capacity.
    ///
    /// A mapped arena whose mapping already covers the new capacity grows in
    /// place. Otherwise the arena moves to a new buffer, its base address
    /// changes and every tracking record is rebased.
    ///
    /// # Errors
    ///
    /// [`ArenaError::Exhausted`] for caller-provided buffers that are full,
    /// or if the new capacity overflows.
    pub fn grow(&mut self, min_extra: usize) -> Result<usize> {
        let capacity = self.capacity();
        let required = capacity
            .checked_add(min_extra)
            .ok_or_else(|| self.exhausted(usize::MAX))?;
        let target = self
            .config
            .grow_policy
            .next_capacity(capacity, required)
            .ok_or_else(|| self.exhausted(required))?;

        let _span = trace_op(ArenaOp::Grow, self.id);
        let limit = self.backing.limit();
        if target <= limit {
            self.end = self.base + target;
        } else if self.backing.is_relocatable() {
            self.relocate(target)?;
        } else if required <= limit {
            self.end = self.base + limit;
        } else {
            return Err(self.exhausted(required));
        }

        self.metrics.grows += 1;
        global_metrics().record_grow();
        log_capacity(capacity, self.capacity());
        Ok(self.capacity())
    }

    /// Releases capacity past the used bytes.
    ///
    /// Keeps the configured trim reserve unless `trim_all`. A heap arena
    /// moves to a smaller buffer; a mapped arena stays put and hands the
    /// pages past its new end back to the OS. Caller-provided buffers never
    /// shrink. Returns whether capacity was released.
    pub fn shrink(&mut self, trim_all: bool) -> bool {
        let capacity = self.capacity();
        let reserve = if trim_all { 0 } else { self.config.trim_reserve };
        let keep = round_up(self.used().saturating_add(reserve))
            .unwrap_or(usize::MAX)
            .min(capacity);
        if keep >= capacity {
            return false;
        }

        let _span = trace_op(ArenaOp::Shrink, self.id);
        let shrunk = match self.backing {
            Backing::Empty | Backing::External { .. } => false,
            Backing::Mapped(_) => {
                self.end = self.base + keep;
                self.backing.discard_from(keep);
                true
            }
            Backing::Heap { .. } => self.relocate(keep).is_ok(),
        };

        if shrunk {
            self.metrics.shrinks += 1;
            log_capacity(capacity, self.capacity());
        }
        shrunk
    }

    /// Defragments every frame, trims every frame and shrinks the arena.
    pub fn pack(&mut self) -> PackStats {
        let start = Instant::now();
        let _span = trace_op(ArenaOp::Pack, self.id);
        self.drain_releases();
        let capacity_before = self.capacity();

        let bytes_compacted = (0..self.frames.len()).map(|index| self.defrag_at(index)).sum();
        let bytes_trimmed = (0..self.frames.len()).map(|index| self.trim_at(index)).sum();
        self.shrink(false);

        self.metrics.packs += 1;
        global_metrics().record_pack();
        PackStats {
            bytes_compacted,
            bytes_trimmed,
            capacity_before,
            capacity_after: self.capacity(),
            duration: start.elapsed(),
        }
    }

    /// Moves the arena to a fresh buffer of `capacity` bytes.
    fn relocate(&mut self, capacity: usize) -> Result<()> {
        let used = self.used();
        let backing = Backing::allocate(self.config.backing, capacity)?;
        if used > 0 {
            // SAFETY: `[base, top)` is initialized in the old buffer and the
            // new one has room for it. The buffers are distinct allocations.
            unsafe { ptr::copy_nonoverlapping(slot::ptr_at(self.base), backing.as_ptr(), used) };
        }

        let old_base = self.base;
        let new_base = backing.base();
        let old = mem::replace(&mut self.backing, backing);
        let (delta, direction) = MoveDirection::between(old_base, new_base);
        let rebased = self.register_move_all(delta, direction);
        self.end = self.base + capacity;
        drop(old);

        self.metrics.relocations += 1;
        self.metrics.bytes_relocated += used;
        self.metrics.records_rebased += rebased;
        global_metrics().record_relocation(used, rebased);
        log_relocation(old_base, new_base, used, rebased);
        Ok(())
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Makes room for `need` more bytes in the frame at `index`.
    fn reserve(&mut self, index: usize, need: usize) -> Result<()> {
        let available = self.frames[index].available();
        if available >= need {
            return Ok(());
        }
        let shortfall = need - available;
        let tail = self.end - self.top;
        if tail < shortfall {
            self.grow(shortfall - tail)?;
        }
        self.shift_above_at(index);
        Ok(())
    }

    /// Allocates an untyped slot in the frame at `index`. Returns the
    /// payload address.
    fn carve(&mut self, index: usize, size: usize) -> Result<usize> {
        let size = round_up(size).ok_or_else(|| self.exhausted(usize::MAX))?;
        let need = HEADER_SIZE
            .checked_add(size)
            .ok_or_else(|| self.exhausted(usize::MAX))?;
        self.reserve(index, need)?;
        self.metrics.slots_allocated += 1;
        // SAFETY: `reserve` guaranteed `need` free bytes at the frame's top.
        Ok(unsafe { self.frames[index].bump(size) })
    }

    /// Allocates `size` uninitialized bytes in `frame`.
    ///
    /// The size is rounded up to the slot alignment; 0 is allowed. The
    /// pointer is aligned to [`SLOT_ALIGN`] and stays good only until the
    /// next structural operation. Use [`bind`](Self::bind) to get a handle
    /// that survives moves.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`] or [`ArenaError::Exhausted`].
    pub fn malloc(&mut self, frame: FrameId, size: usize) -> Result<NonNull<u8>> {
        let index = self.index_of(frame)?;
        self.drain_releases();
        let addr = self.carve(index, size)?;
        Ok(payload_ptr(addr))
    }

    /// Destroys the slot whose payload starts at `ptr`.
    ///
    /// Runs the slot's finalizer and drop, invalidates its handles and
    /// returns the payload size released. A non-collectable
    /// [`Managed`] payload is finalized but keeps its storage, and 0 is
    /// returned. Destroying a slot that is already free is a no-op that
    /// also returns 0.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`], or [`ArenaError::NotASlot`] if no slot
    /// of `frame` has its payload at `ptr`.
    pub fn destroy(&mut self, frame: FrameId, ptr: NonNull<u8>) -> Result<usize> {
        let index = self.index_of(frame)?;
        let addr = ptr.as_ptr().addr();
        // SAFETY: `&mut self` rules out references into the payload.
        let (size, was_live) =
            unsafe { self.frames[index].destroy(addr) }.ok_or(ArenaError::NotASlot { addr })?;
        if was_live {
            self.metrics.slots_destroyed += 1;
        }
        Ok(size)
    }

    /// Moves `value` into a new slot of `frame`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnknownFrame`], [`ArenaError::Exhausted`], or
    /// [`ArenaError::UnsupportedAlignment`] for types aligned beyond
    /// [`SLOT_ALIGN`].
    pub fn alloc<T: 'static>(&mut self, frame: FrameId, value: T) -> Result<Handle<T>> {
        self.alloc_with(frame, value, SlotType::plain())
    }

    /// Like [`alloc`](Self::alloc), registering the [`Managed`] callbacks.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_managed<T: Managed>(&mut self, frame: FrameId, value: T) -> Result<Handle<T>> {
        self.alloc_with(frame, value, SlotType::plain().managed())
    }

    /// Like [`alloc`](Self::alloc), registering a copy callback so the value
    /// can be [`append`](Self::append)ed to other frames.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_cloneable<T: Clone + 'static>(
        &mut self,
        frame: FrameId,
        value: T,
    ) -> Result<Handle<T>> {
        self.alloc_with(frame, value, SlotType::plain().cloneable())
    }

    /// Moves `value` into a new slot of `frame` with the callbacks `ty`
    /// selects.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_with<T: 'static>(
        &mut self,
        frame: FrameId,
        value: T,
        ty: SlotType<T>,
    ) -> Result<Handle<T>> {
        check_align::<T>()?;
        let vtable = ty.register();
        let index = self.index_of(frame)?;
        self.drain_releases();
        let addr = self.carve(index, mem::size_of::<T>())?;
        // SAFETY: the slot was just carved with room for a `T` at an address
        // aligned to `SLOT_ALIGN >= align_of::<T>()`.
        unsafe {
            slot::ptr_at(addr).cast::<T>().write(value);
            let header = slot::header_at(addr - HEADER_SIZE);
            slot::set_type(header, vtable);
            Ok(Handle::from_raw(self.track(header, addr, Some(vtable))))
        }
    }

    /// Creates the tracking record for a slot and returns its first handle.
    ///
    /// # Safety
    ///
    /// `header` must be the untracked header of the slot at `addr`.
    unsafe fn track(
        &self,
        header: *mut SlotHeader,
        addr: usize,
        vtable: Option<&'static SlotVTable>,
    ) -> RawHandle {
        let record = TrackingRecord::new_in_arena(addr, self.id, vtable);
        // SAFETY: guaranteed by the caller.
        unsafe { (*header).record = record.as_ptr() };
        RawHandle::from_record(record)
    }

    /// Places `value` in its own heap allocation, tracked by a record of this
    /// arena. The value never moves, and the handle behaves like an arena
    /// handle except that [`Handle::is_memory_managed`] is `false`.
    #[must_use]
    pub fn detach<T: 'static>(&self, value: T) -> Handle<T> {
        self.detach_with(value, SlotType::plain())
    }

    /// Like [`detach`](Self::detach) with explicit callbacks.
    #[must_use]
    pub fn detach_with<T: 'static>(&self, value: T, ty: SlotType<T>) -> Handle<T> {
        let vtable = ty.register();
        let ptr = Box::into_raw(Box::new(value));
        let record = TrackingRecord::new_detached(ptr.expose_provenance(), self.id, vtable);
        Handle::from_raw(RawHandle::from_record(record))
    }

    /// Returns a handle to a slot obtained from [`malloc`](Self::malloc),
    /// creating its tracking record on first use. An untyped slot is bound
    /// to `T` with the callbacks `ty` selects.
    ///
    /// # Errors
    ///
    /// [`ArenaError::NotASlot`] if `ptr` is not a live slot payload of this
    /// arena or is too small for a `T`, [`ArenaError::InvalidCast`] if the
    /// slot is already bound to another type.
    ///
    /// # Safety
    ///
    /// If the slot is untyped, its payload must hold a valid `T`.
    pub unsafe fn bind<T: 'static>(&mut self, ptr: NonNull<T>, ty: SlotType<T>) -> Result<Handle<T>> {
        check_align::<T>()?;
        self.drain_releases();
        let addr = ptr.as_ptr().addr();
        let (_, header) = self.locate(addr).ok_or(ArenaError::NotASlot { addr })?;

        // SAFETY: `locate` returned a live slot header of this arena.
        unsafe {
            match (*header).vtable.as_ref() {
                None => {
                    if (*header).size < mem::size_of::<T>() {
                        return Err(ArenaError::NotASlot { addr });
                    }
                    slot::set_type(header, ty.register());
                }
                Some(existing) if !existing.is::<T>() => {
                    return Err(ArenaError::InvalidCast {
                        from: existing.type_name(),
                        to: std::any::type_name::<T>(),
                    });
                }
                Some(_) => {}
            }

            let vtable = (*header).vtable.as_ref();
            let raw = match NonNull::new((*header).record.cast_mut()) {
                Some(record) if record.as_ref().try_increment_refs() => RawHandle::adopt(record),
                Some(record) => {
                    // Its last shared handle was dropped after the drain
                    // above. Cut it loose so the queued reclaim leaves the
                    // slot alone, and track the slot afresh.
                    record.as_ref().invalidate();
                    (*header).record = ptr::null();
                    self.track(header, addr, vtable)
                }
                None => self.track(header, addr, vtable),
            };
            Ok(Handle::from_raw(raw))
        }
    }

    // ========================================================================
    // Cross-frame copies and moves
    // ========================================================================

    /// Clones the target of `source` into a new slot of `frame`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::NotCopyable`] if the type was registered without a copy
    /// callback, plus the errors of [`alloc`](Self::alloc) and
    /// [`Handle::get`].
    pub fn append<T: 'static>(&mut self, frame: FrameId, source: &Handle<T>) -> Result<Handle<T>> {
        let record = source.record();
        self.check_owner(record)?;
        record.resolve()?;
        let vtable = record.vtable().ok_or(ArenaError::NotCopyable {
            type_name: std::any::type_name::<T>(),
        })?;
        let copy = vtable.copy_fn.ok_or(ArenaError::NotCopyable {
            type_name: vtable.type_name(),
        })?;

        let index = self.index_of(frame)?;
        let addr = self.carve(index, vtable.size())?;
        // Carving may have moved the source.
        let src = record.resolve()?;
        // SAFETY: `src` holds a live `T`, `addr` is a fresh slot sized for one.
        unsafe {
            copy(slot::ptr_at(src), slot::ptr_at(addr));
            let header = slot::header_at(addr - HEADER_SIZE);
            slot::set_type(header, vtable);
            Ok(Handle::from_raw(self.track(header, addr, Some(vtable))))
        }
    }

    /// Copies the slot whose payload is `source` into a new slot of `frame`.
    ///
    /// Untyped slots are copied byte for byte; typed slots through their
    /// copy callback. The copy is untracked. Returns its payload pointer.
    ///
    /// # Errors
    ///
    /// [`ArenaError::NotASlot`], [`ArenaError::NotCopyable`],
    /// [`ArenaError::UnknownFrame`] or [`ArenaError::Exhausted`].
    pub fn append_raw(&mut self, frame: FrameId, source: NonNull<u8>) -> Result<NonNull<u8>> {
        let addr = source.as_ptr().addr();
        let (src_index, header) = self.locate(addr).ok_or(ArenaError::NotASlot { addr })?;
        // SAFETY: `locate` returned a live slot header.
        let (size, vtable) = unsafe { ((*header).size, (*header).vtable.as_ref()) };
        let copy = match vtable {
            Some(vtable) => Some(vtable.copy_fn.ok_or(ArenaError::NotCopyable {
                type_name: vtable.type_name(),
            })?),
            None => None,
        };
        let offset = addr - self.frames[src_index].base;

        let index = self.index_of(frame)?;
        let dst = self.carve(index, size)?;
        // Frames only slide during carving; offsets inside a frame hold.
        let src = self.frames[src_index].base + offset;

        // SAFETY: `src` is the live payload found above at its current
        // address, `dst` a fresh slot of the same size.
        unsafe {
            match (copy, vtable) {
                (Some(copy), Some(vtable)) => {
                    copy(slot::ptr_at(src), slot::ptr_at(dst));
                    slot::set_type(slot::header_at(dst - HEADER_SIZE), vtable);
                }
                _ => ptr::copy_nonoverlapping(slot::ptr_at(src), slot::ptr_at(dst), size),
            }
        }
        Ok(payload_ptr(dst))
    }

    /// Moves the target of `handle` into `frame` without copying it through
    /// its type. The old slot becomes a hole; only this target's record is
    /// updated.
    ///
    /// # Errors
    ///
    /// [`ArenaError::NotASlot`] for detached targets, plus the errors of
    /// [`malloc`](Self::malloc) and [`Handle::get`].
    pub fn transplant<T: 'static>(&mut self, frame: FrameId, handle: &Handle<T>) -> Result<()> {
        let record = handle.record();
        self.check_owner(record)?;
        let addr = record.resolve()?;
        let (src_index, header) = self.locate(addr).ok_or(ArenaError::NotASlot { addr })?;
        // SAFETY: `locate` returned a live slot header.
        let size = unsafe { (*header).size };
        let offset = addr - self.frames[src_index].base;

        let index = self.index_of(frame)?;
        let dst = self.carve(index, size)?;
        let src = self.frames[src_index].base + offset;

        // SAFETY: both slots are live and distinct. The payload is moved
        // bytewise, then the source header is emptied without running drop.
        unsafe {
            ptr::copy_nonoverlapping(slot::ptr_at(src), slot::ptr_at(dst), size);
            let from = slot::header_at(src - HEADER_SIZE);
            let to = slot::header_at(dst - HEADER_SIZE);
            (*to).flags = (*from).flags;
            (*to).tag = (*from).tag;
            (*to).vtable = (*from).vtable;
            (*to).record = (*from).record;
            (*from).flags = 0;
            (*from).tag = 0;
            (*from).vtable = ptr::null();
            (*from).record = ptr::null();
            ptr::write_bytes(slot::ptr_at(src), 0, size);
        }

        let target = &self.frames[index];
        self.frames[src_index].register_move_single(record, target, dst - target.base);
        self.metrics.records_rebased += 1;
        Ok(())
    }
}

#[inline]
fn payload_ptr(addr: usize) -> NonNull<u8> {
    // SAFETY: payload addresses sit past a header inside the buffer, never 0.
    unsafe { NonNull::new_unchecked(slot::ptr_at(addr)) }
}

fn check_align<T>() -> Result<()> {
    if mem::align_of::<T>() > SLOT_ALIGN {
        return Err(ArenaError::UnsupportedAlignment {
            type_name: std::any::type_name::<T>(),
            align: mem::align_of::<T>(),
            max: SLOT_ALIGN,
        });
    }
    Ok(())
}

impl Locator for Arena {
    fn base_address(&self) -> usize {
        self.base
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn register_move_all(&mut self, delta: usize, direction: MoveDirection) -> usize {
        self.base = direction.apply(self.base, delta);
        self.end = direction.apply(self.end, delta);
        self.top = direction.apply(self.top, delta);
        self.frames
            .iter_mut()
            .map(|region| region.register_move_all(delta, direction))
            .sum()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.drain_releases();
        for region in self.frames.iter_mut().rev() {
            // SAFETY: the arena is going away; nothing can borrow into it.
            unsafe { region.clear() };
            region.live = false;
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}
