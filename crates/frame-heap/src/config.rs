//! Arena configuration.

use crate::slot::{round_up, SLOT_ALIGN};

/// Smallest capacity a doubling arena grows to.
const MIN_DOUBLING_CAPACITY: usize = 256;

/// How much capacity a grow adds beyond the immediate shortfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowPolicy {
    /// Grow by exactly the shortfall.
    Exact,
    /// Round the new capacity up to a multiple of this many bytes.
    Increment(usize),
    /// At least double the current capacity.
    #[default]
    Doubling,
}

impl GrowPolicy {
    /// Policy for a numeric grow rate: 0 means exact, anything else an
    /// increment in bytes.
    #[must_use]
    pub const fn from_rate(rate: usize) -> Self {
        if rate == 0 {
            Self::Exact
        } else {
            Self::Increment(rate)
        }
    }

    /// Capacity to grow to when `required` bytes are needed and `current`
    /// are available. Always at least `required` and slot aligned.
    #[must_use]
    pub fn next_capacity(self, current: usize, required: usize) -> Option<usize> {
        let target = match self {
            Self::Exact | Self::Increment(0) => required,
            Self::Increment(step) => required.div_ceil(step).checked_mul(step)?,
            Self::Doubling => required
                .max(current.checked_mul(2)?)
                .max(MIN_DOUBLING_CAPACITY),
        };
        round_up(target)
    }
}

/// Which memory an arena lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackingKind {
    /// The global allocator.
    #[default]
    Heap,
    /// Anonymous page mappings. Capacity is rounded up to whole pages, so a
    /// grow can often be satisfied without moving, and a shrink hands pages
    /// back to the OS in place.
    Mapped,
}

/// Arena construction parameters.
///
/// ```
/// use frame_heap::{ArenaConfig, BackingKind};
///
/// let config = ArenaConfig::new()
///     .initial_blocks(4)
///     .block_size(1024)
///     .grow_rate(4096)
///     .backing(BackingKind::Heap);
/// assert_eq!(config.capacity(), 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    pub(crate) initial_blocks: usize,
    pub(crate) block_size: usize,
    pub(crate) grow_policy: GrowPolicy,
    pub(crate) trim_reserve: usize,
    pub(crate) backing: BackingKind,
    pub(crate) blank_frames: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaConfig {
    /// 16 blocks of 256 bytes, doubling growth, no trim reserve.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_blocks: 16,
            block_size: 256,
            grow_policy: GrowPolicy::Doubling,
            trim_reserve: 0,
            backing: BackingKind::Heap,
            blank_frames: false,
        }
    }

    /// Number of blocks allocated up front.
    #[must_use]
    pub const fn initial_blocks(mut self, blocks: usize) -> Self {
        self.initial_blocks = blocks;
        self
    }

    /// Size of one block in bytes.
    #[must_use]
    pub const fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the initial capacity directly.
    #[must_use]
    pub const fn initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_blocks = 1;
        self.block_size = bytes;
        self
    }

    /// Grow in multiples of `bytes`; 0 grows by exactly the shortfall.
    #[must_use]
    pub const fn grow_rate(mut self, bytes: usize) -> Self {
        self.grow_policy = GrowPolicy::from_rate(bytes);
        self
    }

    /// Sets the grow policy.
    #[must_use]
    pub const fn grow_policy(mut self, policy: GrowPolicy) -> Self {
        self.grow_policy = policy;
        self
    }

    /// Free bytes a trimmed frame keeps, and the default for new frames.
    #[must_use]
    pub const fn trim_reserve(mut self, bytes: usize) -> Self {
        self.trim_reserve = bytes;
        self
    }

    /// Selects the backing memory.
    #[must_use]
    pub const fn backing(mut self, backing: BackingKind) -> Self {
        self.backing = backing;
        self
    }

    /// Zero a frame's free space when it is pushed.
    #[must_use]
    pub const fn blank_frames(mut self, blank: bool) -> Self {
        self.blank_frames = blank;
        self
    }

    /// Initial capacity in bytes, rounded up to the slot alignment.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        let bytes = self.initial_blocks.saturating_mul(self.block_size);
        match round_up(bytes) {
            Some(bytes) => bytes,
            None => usize::MAX & !(SLOT_ALIGN - 1),
        }
    }

    /// The configured grow policy.
    #[must_use]
    pub const fn policy(&self) -> GrowPolicy {
        self.grow_policy
    }

    /// The configured backing.
    #[must_use]
    pub const fn backing_kind(&self) -> BackingKind {
        self.backing
    }

    /// The configured trim reserve.
    #[must_use]
    pub const fn reserve(&self) -> usize {
        self.trim_reserve
    }
}
