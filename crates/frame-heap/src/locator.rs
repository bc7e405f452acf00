//! The locator contract.
//!
//! A locator owns a span of memory that can move. It translates between
//! absolute addresses and offsets from its base, and it is told when its
//! contents move so it can rewrite the tracking records that point into it.
//! Both [`Arena`](crate::Arena) and each frame implement it; the arena
//! forwards moves to every frame it holds.

use crate::record::TrackingRecord;

/// Which way a block of memory moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    /// Towards higher addresses.
    Up,
    /// Towards lower addresses.
    Down,
}

impl MoveDirection {
    /// Distance and direction of a move from `from` to `to`.
    #[must_use]
    pub const fn between(from: usize, to: usize) -> (usize, Self) {
        if to >= from {
            (to - from, Self::Up)
        } else {
            (from - to, Self::Down)
        }
    }

    /// Applies a move of `delta` bytes to `addr`.
    #[must_use]
    pub const fn apply(self, addr: usize, delta: usize) -> usize {
        match self {
            Self::Up => addr + delta,
            Self::Down => addr - delta,
        }
    }
}

/// Something that owns relocatable memory and the records pointing into it.
///
/// Frames hold absolute bounds rather than offsets into their arena, so a
/// frame answers address math on its own and needs no path back to the
/// arena. When the arena moves, it moves every frame through
/// [`register_move_all`](Self::register_move_all).
pub trait Locator {
    /// Absolute address of the first byte the locator owns.
    fn base_address(&self) -> usize;

    /// Offset of `absolute` from [`base_address`](Self::base_address).
    fn address_offset(&self, absolute: usize) -> usize {
        absolute - self.base_address()
    }

    /// Absolute address of `offset` bytes past the base.
    fn absolute_address(&self, offset: usize) -> usize {
        self.base_address() + offset
    }

    /// Whether the locator still owns live memory.
    fn is_valid(&self) -> bool;

    /// Everything the locator owns moved by `delta` bytes.
    ///
    /// Implementations adjust their own bounds and rebase every tracking
    /// record pointing into them. Returns the number of records rebased.
    fn register_move_all(&mut self, delta: usize, direction: MoveDirection) -> usize;

    /// A single object moved to `offset` within `target`.
    ///
    /// Only `record` is rewritten; nothing else in either locator moves.
    fn register_move_single(&self, record: &TrackingRecord, target: &dyn Locator, offset: usize) {
        record.relocate(target.absolute_address(offset));
    }
}
