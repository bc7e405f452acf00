//! Arena metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Counters for the structural operations of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaMetrics {
    /// Successful grows.
    pub grows: usize,
    /// Grows and shrinks that moved the whole arena to a new buffer.
    pub relocations: usize,
    /// Bytes copied by relocations.
    pub bytes_relocated: usize,
    /// Shrinks that released capacity.
    pub shrinks: usize,
    /// Defragment passes.
    pub defrags: usize,
    /// Frames trimmed.
    pub trims: usize,
    /// Frames expanded.
    pub expands: usize,
    /// Times regions were slid towards the arena end.
    pub shifts: usize,
    /// Frames pushed.
    pub frames_added: usize,
    /// Frames removed.
    pub frames_removed: usize,
    /// Slots handed out.
    pub slots_allocated: usize,
    /// Slots destroyed, by handle, by address or by frame teardown.
    pub slots_destroyed: usize,
    /// Tracking record address updates.
    pub records_rebased: usize,
    /// Pack passes.
    pub packs: usize,
    /// Records whose last reference was dropped through a
    /// [`SharedHandle`](crate::SharedHandle) and reclaimed by the arena.
    pub deferred_releases: usize,
}

impl ArenaMetrics {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            grows: 0,
            relocations: 0,
            bytes_relocated: 0,
            shrinks: 0,
            defrags: 0,
            trims: 0,
            expands: 0,
            shifts: 0,
            frames_added: 0,
            frames_removed: 0,
            slots_allocated: 0,
            slots_destroyed: 0,
            records_rebased: 0,
            packs: 0,
            deferred_releases: 0,
        }
    }
}

/// Result of [`Arena::pack`](crate::Arena::pack).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Bytes of holes removed by defragmenting.
    pub bytes_compacted: usize,
    /// Bytes given back by trimming frames.
    pub bytes_trimmed: usize,
    /// Capacity before packing.
    pub capacity_before: usize,
    /// Capacity after packing.
    pub capacity_after: usize,
    /// Wall time spent.
    pub duration: Duration,
}

impl PackStats {
    /// Capacity released by the final shrink.
    #[must_use]
    pub const fn bytes_released(&self) -> usize {
        self.capacity_before.saturating_sub(self.capacity_after)
    }
}

/// Process-wide counters, summed over every arena.
#[derive(Debug)]
pub struct GlobalMetrics {
    arenas_created: AtomicU64,
    grows: AtomicUsize,
    relocations: AtomicUsize,
    bytes_relocated: AtomicUsize,
    records_rebased: AtomicUsize,
    packs: AtomicUsize,
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Process-wide arena counters.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

impl GlobalMetrics {
    const fn new() -> Self {
        Self {
            arenas_created: AtomicU64::new(0),
            grows: AtomicUsize::new(0),
            relocations: AtomicUsize::new(0),
            bytes_relocated: AtomicUsize::new(0),
            records_rebased: AtomicUsize::new(0),
            packs: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_arena_created(&self) {
        self.arenas_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_grow(&self) {
        self.grows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relocation(&self, bytes: usize, records: usize) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_relocated.fetch_add(bytes, Ordering::Relaxed);
        self.records_rebased.fetch_add(records, Ordering::Relaxed);
    }

    pub(crate) fn record_pack(&self) {
        self.packs.fetch_add(1, Ordering::Relaxed);
    }

    /// Arenas created since process start.
    pub fn arenas_created(&self) -> u64 {
        self.arenas_created.load(Ordering::Relaxed)
    }

    /// Grows across all arenas.
    pub fn grows(&self) -> usize {
        self.grows.load(Ordering::Relaxed)
    }

    /// Whole-arena relocations across all arenas.
    pub fn relocations(&self) -> usize {
        self.relocations.load(Ordering::Relaxed)
    }

    /// Bytes copied by relocations.
    pub fn bytes_relocated(&self) -> usize {
        self.bytes_relocated.load(Ordering::Relaxed)
    }

    /// Records rebased by relocations.
    pub fn records_rebased(&self) -> usize {
        self.records_rebased.load(Ordering::Relaxed)
    }

    /// Pack passes across all arenas.
    pub fn packs(&self) -> usize {
        self.packs.load(Ordering::Relaxed)
    }
}
