//! A relocating, stack-disciplined region allocator.
//!
//! `frame-heap` hands out memory from an [`Arena`]: one contiguous buffer
//! split into frames that are pushed and popped like a stack. Allocation is
//! a bump inside a frame. Frames can be compacted, trimmed and expanded, and
//! the whole arena can grow or shrink by moving to a new buffer.
//!
//! Objects are reached through [`Handle`]s, which point at a stable
//! [`TrackingRecord`] rather than at the object. When the arena moves memory
//! it rewrites the affected records, so handles survive every relocation.
//!
//! # Features
//!
//! - **Relocation-safe handles**: reference counted, nullable, comparable
//! - **Cross-thread handles**: [`SharedHandle`] for readers on other threads
//! - **Frames**: stack-ordered sub-arenas, released in one step
//! - **Compaction**: per-frame defragment, trim, expand and whole-arena pack
//! - **Managed objects**: finalize-before-delete via [`Managed`] and
//!   `#[derive(Managed)]`, including non-collectable singletons
//!
//! # Quick Start
//!
//! ```
//! use frame_heap::Arena;
//!
//! let mut arena = Arena::with_capacity(1024);
//! let frame = arena.add_frame();
//!
//! let alpha = arena.alloc(frame, String::from("alpha")).unwrap();
//! let beta = arena.alloc(frame, String::from("beta")).unwrap();
//! let gamma = arena.alloc(frame, String::from("gamma")).unwrap();
//!
//! beta.destroy(&mut arena).unwrap();
//! arena.defrag(frame).unwrap();
//!
//! assert_eq!(alpha.get(&arena).unwrap(), "alpha");
//! assert_eq!(gamma.get(&arena).unwrap(), "gamma");
//! assert!(beta.get(&arena).is_err());
//! ```
//!
//! # Thread Safety
//!
//! [`Arena`] and [`Handle`] are `!Send` and `!Sync`: an arena, and every
//! dereference of its objects, stays on one thread. Tracking records are
//! atomic, so a [`SharedHandle`] can be cloned, dropped, checked and
//! resolved from any thread while the owner keeps moving memory. A target
//! whose last reference is dropped off-thread is reclaimed by its arena.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod backing;
mod config;
mod error;
mod handle;
mod locator;
mod managed;
mod metrics;
mod record;
mod region;
mod shared;
mod slot;
mod tracing;

/// Per-type slot tables and the process-wide registrar.
pub mod registry;

pub use arena::{Arena, FrameId, FrameInfo, SlotInfo};
pub use config::{ArenaConfig, BackingKind, GrowPolicy};
pub use error::{ArenaError, Result};
pub use handle::{AnyHandle, Handle};
pub use locator::{Locator, MoveDirection};
pub use managed::Managed;
pub use metrics::{global_metrics, ArenaMetrics, GlobalMetrics, PackStats};
pub use record::TrackingRecord;
pub use shared::SharedHandle;
pub use registry::{SlotType, SlotVTable, TypeTag};
pub use slot::{HEADER_SIZE, SLOT_ALIGN};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use frame_heap_derive::Managed;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    /// Tracking records created for arena `arena_id` and not yet freed.
    #[must_use]
    pub fn live_records(arena_id: u64) -> usize {
        crate::record::live_records(arena_id)
    }
}
