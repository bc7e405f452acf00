//! Arena tracing support.
//!
//! When the `tracing` feature is enabled, structural operations (grow,
//! shrink, pack, defragment, trim, expand, shift, frame removal) open spans
//! tagged with the arena id and an operation id, and emit events for
//! relocations, capacity changes, frame pushes and compactions.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Structural operations that get their own span.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ArenaOp {
        /// Capacity increase.
        Grow,
        /// Capacity decrease.
        Shrink,
        /// Defragment, trim and shrink everything.
        Pack,
        /// Compact one frame.
        Defrag,
        /// Shrink one frame to its used bytes plus reserve.
        Trim,
        /// Grow one frame into the free tail.
        Expand,
        /// Slide the frames above one frame to the arena end.
        Shift,
        /// Remove a frame.
        RemoveFrame,
    }

    /// Correlates the events of one structural operation. Starts at 1 and
    /// increases for every span opened in the process.
    static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

    /// Create a span for a structural operation on one arena.
    pub fn trace_op(op: ArenaOp, arena_id: u64) -> span::EnteredSpan {
        let op_id = NEXT_OP_ID.fetch_add(1, Ordering::Relaxed);
        span!(Level::DEBUG, "arena_op", op = ?op, arena_id, op_id).entered()
    }

    /// Log a whole-arena relocation.
    pub fn log_relocation(old_base: usize, new_base: usize, bytes: usize, records: usize) {
        tracing::debug!(old_base, new_base, bytes, records, "arena_relocated");
    }

    /// Log a capacity change.
    pub fn log_capacity(before: usize, after: usize) {
        tracing::debug!(before, after, "capacity_changed");
    }

    /// Log a frame push.
    pub fn log_frame_added(serial: u64, base: usize, len: usize) {
        tracing::trace!(serial, base, len, "frame_added");
    }

    /// Log frame compaction results.
    pub fn log_compaction(serial: u64, moved: usize, reclaimed: usize) {
        tracing::trace!(serial, moved, reclaimed, "frame_compacted");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ArenaOp {
        /// Capacity increase.
        Grow,
        /// Capacity decrease.
        Shrink,
        /// Defragment, trim and shrink everything.
        Pack,
        /// Compact one frame.
        Defrag,
        /// Shrink one frame to its used bytes plus reserve.
        Trim,
        /// Grow one frame into the free tail.
        Expand,
        /// Slide the frames above one frame to the arena end.
        Shift,
        /// Remove a frame.
        RemoveFrame,
    }

    /// Stub span guard when tracing is disabled.
    #[derive(Debug)]
    pub struct EnteredSpan;

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn trace_op(_op: ArenaOp, _arena_id: u64) -> EnteredSpan {
        EnteredSpan
    }

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_relocation(_old_base: usize, _new_base: usize, _bytes: usize, _records: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_capacity(_before: usize, _after: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_frame_added(_serial: u64, _base: usize, _len: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_compaction(_serial: u64, _moved: usize, _reclaimed: usize) {}
}

pub use internal::ArenaOp;
